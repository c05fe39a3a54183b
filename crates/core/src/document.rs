//! The file handle: open, query, mutate and write documents
//!
//! A [`Document`] owns the decoded tree and the block readers its arrays are
//! bound to. Array bytes stay in the file until they are touched.

use crate::array::{ArrayAccess, Buffer};
use crate::block::{Backing, BlockReader, BlockRef, BlockStore, Payload};
use crate::codec::{exploded_name, Decoder, EncodeOptions, Encoder, SourceNaming, Warning};
use crate::compression::{CodecRegistry, Compression};
use crate::config::Config;
use crate::container::{open_backing, open_reader, pad_text, read_layout, read_text, write_atomic, write_container, Layout};
use crate::describe::Summary;
use crate::error::{Error, Result};
use crate::history::HistoryEntry;
use crate::node::Node;
use crate::path::{KeyPath, PathSegment};
use crate::registry::{BlockResolver, BlockSource, TagRegistry};
use crate::search::Search;
use crate::tag::{Version, DEFAULT_SCHEMA};
use crate::text::{emit_document, parse_document};
use crate::validate::{self, CoreValidator, Validator};
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header lines precede the textual segment
const TEXT_FIRST_LINE: usize = 2;

/// How a document may change its tree, its arrays and its source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Tree and arrays can change in memory; arrays copy on write and the
    /// source file is never touched
    #[default]
    Read,
    /// Tree and array mutations fail with `ReadOnlyViolation`
    ReadOnly,
    /// Arrays change in place and [`Document::update`] writes back
    Update,
}

impl OpenMode {
    fn access(self) -> ArrayAccess {
        match self {
            OpenMode::Read => ArrayAccess::CopyOnWrite,
            OpenMode::ReadOnly => ArrayAccess::ReadOnly,
            OpenMode::Update => ArrayAccess::InPlace,
        }
    }
}

/// Settings for opening a document
#[derive(Clone)]
pub struct OpenOptions {
    mode: OpenMode,
    config: Config,
    validate: Option<bool>,
    registry: Arc<TagRegistry>,
    codecs: Arc<CodecRegistry>,
    validator: Arc<dyn Validator>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::Read,
            config: Config::default(),
            validate: None,
            registry: Arc::new(TagRegistry::with_builtins()),
            codecs: Arc::new(CodecRegistry::new()),
            validator: Arc::new(CoreValidator),
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Validate on open, overriding `Config::validate_on_open`
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn registry(mut self, registry: Arc<TagRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    fn should_validate(&self) -> bool {
        self.validate.unwrap_or(self.config.validate_on_open)
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("validate", &self.validate)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Settings for one write
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Arrays smaller than this many bytes are written inline; `None` uses
    /// the document's config
    pub inline_threshold: Option<usize>,
    /// Compression for every buffer without an explicit choice
    pub compression: Option<Compression>,
    /// Validate the encoded tree before anything is written
    pub validate: bool,
    /// Append the block index and footer
    pub with_index: bool,
    /// Checked between blocks; setting it stops the write
    pub abort: Option<Arc<AtomicBool>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            inline_threshold: None,
            compression: None,
            validate: false,
            with_index: true,
            abort: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = Some(bytes);
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_index(mut self, with_index: bool) -> Self {
        self.with_index = with_index;
        self
    }

    pub fn abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    fn abort_flag(&self) -> Option<&AtomicBool> {
        self.abort.as_deref()
    }
}

/// What [`Document::update`] did to the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Only the textual segment was patched
    Patched,
    /// The whole file was rewritten
    Rewritten,
}

/// Binds `ndarray` sources to lazy buffers while a file is decoded
struct FileBlocks<'a> {
    reader: &'a Arc<BlockReader>,
    access: ArrayAccess,
    dir: Option<&'a Path>,
    mmap: bool,
    codecs: &'a Arc<CodecRegistry>,
    cache: Mutex<AHashMap<BlockSource, Arc<Buffer>>>,
    /// Readers of separate block files opened so far
    external: Mutex<Vec<Arc<BlockReader>>>,
}

impl FileBlocks<'_> {
    fn open_external(&self, name: &str) -> Result<Arc<BlockReader>> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::InvalidPath {
                path: name.to_string(),
                reason: "block file must be relative to the document".into(),
            });
        }
        let dir = self.dir.ok_or_else(|| Error::InvalidPath {
            path: name.to_string(),
            reason: "external blocks need a document on disk".into(),
        })?;
        let backing = open_backing(&dir.join(relative), self.mmap, self.access == ArrayAccess::InPlace)?;
        let layout = read_layout(&backing)?;
        let reader = Arc::new(open_reader(backing, &layout, Arc::clone(self.codecs)));
        if reader.is_empty() {
            return Err(Error::integrity(0, layout.text_end, format!("'{}' holds no block", name)));
        }
        tracing::trace!(file = name, "opened external block file");
        self.external.lock().push(Arc::clone(&reader));
        Ok(reader)
    }
}

impl BlockResolver for FileBlocks<'_> {
    fn resolve(&self, source: &BlockSource) -> Result<Arc<Buffer>> {
        if let Some(buffer) = self.cache.lock().get(source) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = match source {
            BlockSource::Internal(index) => {
                if *index >= self.reader.len() {
                    return Err(Error::integrity(
                        *index,
                        self.reader.backing().len(),
                        format!("file has only {} block(s)", self.reader.len()),
                    ));
                }
                Buffer::from_block(Arc::clone(self.reader), *index, self.access)
            }
            BlockSource::External(name) => Buffer::from_block(self.open_external(name)?, 0, self.access),
        };
        self.cache.lock().insert(source.clone(), Arc::clone(&buffer));
        Ok(buffer)
    }
}

/// The file a document was opened from
struct Source {
    path: Option<PathBuf>,
    layout: Layout,
    reader: Arc<BlockReader>,
    /// Readers of exploded block files
    external: Vec<Arc<BlockReader>>,
}

/// An opened or newly created document
pub struct Document {
    root: Node,
    schema: String,
    mode: OpenMode,
    config: Config,
    registry: Arc<TagRegistry>,
    codecs: Arc<CodecRegistry>,
    validator: Arc<dyn Validator>,
    source: Option<Source>,
    warnings: Vec<Warning>,
    format_version: Version,
    closed: bool,
}

impl Document {
    /// Empty document with the default schema
    pub fn new() -> Self {
        Self::with_options(Node::empty_map(), &OpenOptions::default())
    }

    /// Document around an existing tree; the root must be a mapping
    pub fn from_root(root: Node) -> Result<Self> {
        if root.as_mapping().is_none() {
            return Err(Error::InvalidPath {
                path: "/".into(),
                reason: format!("root must be a mapping, not {}", root.kind()),
            });
        }
        Ok(Self::with_options(root, &OpenOptions::default()))
    }

    fn with_options(root: Node, options: &OpenOptions) -> Self {
        if options.mode == OpenMode::ReadOnly {
            root.freeze();
        }
        Self {
            root,
            schema: DEFAULT_SCHEMA.to_string(),
            mode: options.mode,
            config: options.config.clone(),
            registry: Arc::clone(&options.registry),
            codecs: Arc::clone(&options.codecs),
            validator: Arc::clone(&options.validator),
            source: None,
            warnings: Vec::new(),
            format_version: crate::container::FORMAT_VERSION,
            closed: false,
        }
    }

    /// Open a file
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let writable = options.mode == OpenMode::Update;
        let backing = open_backing(path, options.config.mmap, writable)?;
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Self::load(backing, Some(path), options)
    }

    /// Open an in-memory image
    pub fn from_bytes(bytes: impl Into<Bytes>, options: &OpenOptions) -> Result<Self> {
        Self::load(Backing::Memory(bytes.into()), None, options)
    }

    /// Read a whole stream and open it
    pub fn from_reader<R: Read>(mut reader: R, options: &OpenOptions) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(bytes, options)
    }

    fn load(backing: Backing, path: Option<PathBuf>, options: &OpenOptions) -> Result<Self> {
        let layout = read_layout(&backing)?;
        let text = read_text(&backing, &layout)?;
        let parsed = parse_document(&text, TEXT_FIRST_LINE, layout.text_start)?;
        let raw = match parsed.root {
            Node::Null => Node::empty_map(),
            Node::Mapping(_) => parsed.root,
            other => {
                return Err(Error::TextSegmentParse {
                    line: TEXT_FIRST_LINE + 1,
                    column: 1,
                    offset: layout.text_start,
                    message: format!("document root must be a mapping, found {}", other.kind()),
                })
            }
        };
        let schema = parsed.schema.unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        if options.should_validate() {
            validate::check(options.validator.as_ref(), &raw, &schema)?;
        }

        let reader = Arc::new(open_reader(backing, &layout, Arc::clone(&options.codecs)));
        let resolver = FileBlocks {
            reader: &reader,
            access: options.mode.access(),
            dir: path.as_deref().and_then(Path::parent),
            mmap: options.config.mmap,
            codecs: &options.codecs,
            cache: Mutex::new(AHashMap::new()),
            external: Mutex::new(Vec::new()),
        };
        let (root, warnings) = Decoder::new(&options.registry, &resolver).decode(&raw)?;
        let external = resolver.external.into_inner();

        tracing::debug!(
            path = ?path,
            mode = ?options.mode,
            blocks = reader.len(),
            external = external.len(),
            warnings = warnings.len(),
            "opened document"
        );
        let mut document = Self::with_options(root, options);
        document.schema = schema;
        document.warnings = warnings;
        document.format_version = layout.format_version;
        document.source = Some(Source {
            path,
            layout,
            reader,
            external,
        });
        Ok(document)
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn set_schema(&mut self, schema: impl Into<String>) -> Result<()> {
        self.ensure_writable("/")?;
        self.schema = schema.into();
        Ok(())
    }

    /// Container layout version of the opened file
    pub fn format_version(&self) -> Version {
        self.format_version
    }

    /// Recoverable problems found while decoding
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Blocks in the source file, plus any exploded block files
    pub fn block_count(&self) -> usize {
        self.source
            .as_ref()
            .map_or(0, |s| s.reader.len() + s.external.len())
    }

    /// Path of the source file, if opened from disk
    pub fn path(&self) -> Option<&Path> {
        self.source.as_ref().and_then(|s| s.path.as_deref())
    }

    fn ensure_writable(&self, target: &str) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::read_only(target.to_string()));
        }
        Ok(())
    }

    /// Node at `path`, e.g. `data/list/0`
    pub fn get(&self, path: impl Into<KeyPath>) -> Option<Node> {
        let path = path.into();
        path.segments()
            .iter()
            .try_fold(self.root.clone(), |node, segment| node.child(segment))
    }

    /// Set the node at `path`, creating missing intermediate mappings
    pub fn set(&mut self, path: impl Into<KeyPath>, value: impl Into<Node>) -> Result<()> {
        let path = path.into();
        self.ensure_writable(&path.to_string())?;
        let Some((last, parents)) = path.segments().split_last() else {
            return Err(Error::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be replaced".into(),
            });
        };
        let mut node = self.root.clone();
        let mut walked = KeyPath::root();
        for segment in parents {
            walked.push(segment.clone());
            node = match node.child(segment) {
                Some(child) => child,
                None => insert_child(&node, segment, Node::empty_map(), &walked)?,
            };
        }
        insert_child(&node, last, value.into(), &path)?;
        Ok(())
    }

    /// Remove and return the node at `path`
    pub fn remove(&mut self, path: impl Into<KeyPath>) -> Result<Option<Node>> {
        let path = path.into();
        self.ensure_writable(&path.to_string())?;
        let (Some(last), Some(parent)) = (path.last(), path.parent()) else {
            return Err(Error::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be removed".into(),
            });
        };
        let Some(parent) = self.get(&parent) else {
            return Ok(None);
        };
        let removed = match payload(&parent) {
            Node::Mapping(mapping) => match last {
                PathSegment::Key(key) => mapping.write()?.remove(key),
                PathSegment::Index(index) => mapping.write()?.remove(&index.to_string()),
            },
            Node::Sequence(items) => {
                let mut items = items.write()?;
                match KeyPath::resolve_segment(last) {
                    Some(index) if index < items.len() => Some(items.remove(index)),
                    _ => None,
                }
            }
            _ => None,
        };
        Ok(removed)
    }

    /// Append an entry to `history/entries`
    pub fn append_history(&mut self, description: impl Into<String>) -> Result<()> {
        self.ensure_writable("/history/entries")?;
        let entries = KeyPath::root().key("history").key("entries");
        if self.get(&entries).is_none() {
            self.set(&entries, Node::seq(Vec::<Node>::new()))?;
        }
        let Some(Node::Sequence(items)) = self.get(&entries) else {
            return Err(Error::InvalidPath {
                path: entries.to_string(),
                reason: "history entries must be a sequence".into(),
            });
        };
        let entry = HistoryEntry::now(description);
        tracing::debug!(description = %entry.description, "appended history entry");
        items.write()?.push(Node::custom(entry));
        Ok(())
    }

    /// History entries in order; entries that did not decode are skipped
    pub fn history(&self) -> Vec<HistoryEntry> {
        let Some(Node::Sequence(items)) = self.get(KeyPath::root().key("history").key("entries")) else {
            return Vec::new();
        };
        let entries = items
            .read()
            .iter()
            .filter_map(|n| n.downcast::<HistoryEntry>().cloned())
            .collect();
        entries
    }

    /// Query builder over the tree
    pub fn search(&self) -> Search {
        Search::new(self.root.clone())
    }

    pub fn describe(&self, depth_limit: usize, breadth_limit: usize) -> Summary {
        Summary::of(&self.root, depth_limit, breadth_limit)
    }

    /// Choose the compression of the array at `path` for later writes
    pub fn set_compression(&mut self, path: impl Into<KeyPath>, compression: Compression) -> Result<()> {
        let path = path.into();
        self.ensure_writable(&path.to_string())?;
        self.codecs.by_compression(&compression)?;
        match self.get(&path) {
            Some(Node::Array(array)) => {
                array.buffer().set_compression(compression);
                Ok(())
            }
            Some(other) => Err(Error::InvalidPath {
                path: path.to_string(),
                reason: format!("expected an array, found {}", other.kind()),
            }),
            None => Err(Error::InvalidPath {
                path: path.to_string(),
                reason: "no such node".into(),
            }),
        }
    }

    /// Encode the tree into text and a block store
    fn encode(&self, options: &WriteOptions, naming: SourceNaming) -> Result<(String, BlockStore)> {
        let encode_options = EncodeOptions {
            inline_threshold: options.inline_threshold.unwrap_or(self.config.inline_threshold),
            default_compression: self.config.default_compression.clone(),
            compression_override: options.compression.clone(),
            naming,
        };
        let mut store = BlockStore::new(Arc::clone(&self.codecs));
        let raw = Encoder::new(&self.registry, &mut store, &encode_options).encode(&self.root)?;
        if options.validate {
            validate::check(self.validator.as_ref(), &raw, &self.schema)?;
        }
        let text = emit_document(&raw, Some(&self.schema))?;
        Ok((text, store))
    }

    /// Stream the whole file to `sink`; returns the bytes written
    pub fn write_to<W: Write>(&self, sink: W, options: &WriteOptions) -> Result<u64> {
        let (text, store) = self.encode(options, SourceNaming::Internal)?;
        let blocks = store.prepare()?;
        write_container(sink, &text, &blocks, options.with_index, options.abort_flag())
    }

    /// Write the whole file to `path` atomically
    ///
    /// Writing over the source file rebinds arrays to the new file.
    pub fn write(&mut self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        let path = path.as_ref();
        let onto_source = self.is_source(path);
        if onto_source {
            self.ensure_writable(&path.display().to_string())?;
        }
        let (text, store) = self.encode(options, SourceNaming::Internal)?;
        let blocks = store.prepare()?;
        write_atomic(path, |sink| {
            write_container(sink, &text, &blocks, options.with_index, options.abort_flag()).map(|_| ())
        })?;
        tracing::debug!(path = %path.display(), blocks = blocks.len(), "wrote document");
        if onto_source {
            self.reopen(&store)?;
        }
        Ok(())
    }

    /// Write the text to `path` and every block to its own file beside it
    ///
    /// Block files are named `<stem>NNNN.tsr` after the main file's stem.
    pub fn write_exploded(&self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::InvalidPath {
                path: path.display().to_string(),
                reason: "file name is not valid UTF-8".into(),
            })?
            .to_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let (text, store) = self.encode(options, SourceNaming::Exploded { stem: stem.clone() })?;
        let blocks = store.prepare()?;
        let block_text = emit_document(&Node::empty_map(), Some(&self.schema))?;
        for (index, block) in blocks.iter().enumerate() {
            if options.abort_flag().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(Error::Aborted { blocks_written: index });
            }
            let block_path = dir.join(exploded_name(&stem, index));
            write_atomic(&block_path, |sink| {
                write_container(sink, &block_text, std::slice::from_ref(block), options.with_index, None).map(|_| ())
            })?;
        }
        write_atomic(path, |sink| write_container(sink, &text, &[], false, None).map(|_| ()))?;
        let removed = remove_stale_block_files(&dir, &stem, blocks.len())?;
        tracing::debug!(path = %path.display(), blocks = blocks.len(), removed, "wrote exploded document");
        Ok(())
    }

    /// Write changes back to the source file
    ///
    /// When the blocks are unchanged and the new text fits in the old text
    /// region, only the text is patched. Otherwise the file is rewritten
    /// atomically. Exploded documents are rejected; use
    /// [`Document::write_exploded`] or [`Document::flush`] for them.
    pub fn update(&mut self, options: &WriteOptions) -> Result<UpdateStrategy> {
        if self.mode != OpenMode::Update {
            return Err(Error::read_only(match self.path() {
                Some(path) => path.display().to_string(),
                None => "document source".to_string(),
            }));
        }
        let Some(path) = self.path().map(Path::to_path_buf) else {
            return Err(Error::InvalidPath {
                path: String::new(),
                reason: "document was not opened from a file".into(),
            });
        };
        if self.source.as_ref().is_some_and(|s| !s.external.is_empty()) {
            return Err(Error::InvalidPath {
                path: path.display().to_string(),
                reason: "exploded documents are rewritten with write_exploded".into(),
            });
        }
        self.flush()?;
        let (text, store) = self.encode(options, SourceNaming::Internal)?;
        if let Some(source) = &self.source {
            if source.external.is_empty() && blocks_unchanged(&store, &source.reader) {
                let capacity = source.layout.text_capacity() as usize;
                if let Some(padded) = pad_text(&text, capacity) {
                    patch_text(source, &padded)?;
                    tracing::debug!(path = %path.display(), bytes = text.len(), capacity, "patched text in place");
                    return Ok(UpdateStrategy::Patched);
                }
            }
        }
        let blocks = store.prepare()?;
        write_atomic(&path, |sink| {
            write_container(sink, &text, &blocks, options.with_index, options.abort_flag()).map(|_| ())
        })?;
        tracing::debug!(path = %path.display(), blocks = blocks.len(), "rewrote document");
        self.reopen(&store)?;
        Ok(UpdateStrategy::Rewritten)
    }

    /// Persist in-place array edits; returns the number of blocks flushed
    pub fn flush(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(0);
        };
        let mut flushed = 0;
        for reader in std::iter::once(&source.reader).chain(&source.external) {
            if reader.is_dirty() {
                flushed += reader.flush()?;
            }
        }
        if flushed > 0 {
            tracing::debug!(blocks = flushed, "flushed in-place edits");
        }
        Ok(flushed)
    }

    /// Flush and release the source file
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.flush()?;
        Ok(())
    }

    /// Read and checksum every block now
    pub fn verify_blocks(&self) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        source.reader.verify_all()?;
        for reader in &source.external {
            reader.verify_all()?;
        }
        Ok(())
    }

    fn is_source(&self, path: &Path) -> bool {
        let Some(source) = self.path() else {
            return false;
        };
        match path.canonicalize() {
            Ok(target) => target == source,
            Err(_) => false,
        }
    }

    /// Reopen the source after a rewrite and point buffers at its blocks
    fn reopen(&mut self, store: &BlockStore) -> Result<()> {
        let Some(path) = self.path().map(Path::to_path_buf) else {
            return Ok(());
        };
        let backing = open_backing(&path, self.config.mmap, self.mode == OpenMode::Update)?;
        let layout = read_layout(&backing)?;
        let reader = Arc::new(open_reader(backing, &layout, Arc::clone(&self.codecs)));
        for index in 0..store.len() {
            if let Some(Payload::Buffer(buffer)) = store.payload(BlockRef(index)) {
                buffer.rebind(Arc::clone(&reader), index);
            }
        }
        tracing::trace!(path = %path.display(), blocks = reader.len(), "rebound buffers after rewrite");
        self.source = Some(Source {
            path: Some(path),
            layout,
            reader,
            external: Vec::new(),
        });
        Ok(())
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("path", &self.path())
            .field("mode", &self.mode)
            .field("schema", &self.schema)
            .field("blocks", &self.block_count())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if self.closed || self.mode != OpenMode::Update {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush document on drop");
        }
    }
}

/// Container behind a node, looking through tags
fn payload(node: &Node) -> &Node {
    match node {
        Node::Tagged(tagged) => &tagged.node,
        other => other,
    }
}

/// Delete `<stem>NNNN.tsr` files left over from an earlier, larger explode
fn remove_stale_block_files(dir: &Path, stem: &str, count: usize) -> Result<usize> {
    let mut index = count;
    loop {
        let stale = dir.join(exploded_name(stem, index));
        match std::fs::remove_file(&stale) {
            Ok(()) => {
                tracing::trace!(path = %stale.display(), "removed stale block file");
                index += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index - count),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Insert `value` under `segment` of `parent` and return it
fn insert_child(parent: &Node, segment: &PathSegment, value: Node, path: &KeyPath) -> Result<Node> {
    match payload(parent) {
        Node::Mapping(mapping) => {
            mapping.write()?.insert(segment.to_string(), value.clone());
            Ok(value)
        }
        Node::Sequence(items) => {
            let mut items = items.write()?;
            match KeyPath::resolve_segment(segment) {
                Some(index) if index < items.len() => items[index] = value.clone(),
                Some(index) if index == items.len() => items.push(value.clone()),
                _ => {
                    return Err(Error::InvalidPath {
                        path: path.to_string(),
                        reason: format!("index out of range for sequence of {}", items.len()),
                    })
                }
            }
            Ok(value)
        }
        other => Err(Error::InvalidPath {
            path: path.to_string(),
            reason: format!("cannot add children to {}", other.kind()),
        }),
    }
}

/// True if the pass would write exactly the blocks `reader` already holds
fn blocks_unchanged(store: &BlockStore, reader: &Arc<BlockReader>) -> bool {
    if store.len() != reader.len() {
        return false;
    }
    (0..store.len()).all(|index| {
        let block = BlockRef(index);
        let Some(Payload::Buffer(buffer)) = store.payload(block) else {
            return false;
        };
        let bound = matches!(buffer.source(), Some((r, i)) if Arc::ptr_eq(&r, reader) && i == index);
        bound && reader.compression(index).ok().as_ref() == store.compression(block)
    })
}

/// Overwrite the text region, restoring it if the write fails
fn patch_text(source: &Source, padded: &[u8]) -> Result<()> {
    let backing = source.reader.backing();
    let start = source.layout.text_start;
    let original = backing.read_at(start, padded.len())?;
    let result = backing.patch(start, padded).and_then(|_| backing.flush());
    if let Err(e) = result {
        tracing::warn!(error = %e, "text patch failed, restoring original bytes");
        if let Err(restore) = backing.patch(start, &original).and_then(|_| backing.flush()) {
            tracing::warn!(error = %restore, "could not restore original text");
        }
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::NdArray;
    use tempfile::TempDir;

    fn sample() -> Result<Document> {
        let mut doc = Document::new();
        doc.set("meta/name", "m31")?;
        doc.set("data", NdArray::from_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?)?;
        Ok(doc)
    }

    #[test]
    fn test_set_creates_intermediate_mappings() -> Result<()> {
        let mut doc = Document::new();
        doc.set("a/b/c", 1)?;
        assert_eq!(doc.get("a/b/c"), Some(Node::Int(1)));
        assert!(matches!(doc.get("a/b"), Some(Node::Mapping(_))));
        Ok(())
    }

    #[test]
    fn test_set_and_remove_in_sequences() -> Result<()> {
        let mut doc = Document::new();
        doc.set("list", Node::seq([1, 2]))?;
        doc.set("list/1", 20)?;
        doc.set("list/2", 30)?;
        assert_eq!(doc.get("list"), Some(Node::seq([1, 20, 30])));
        assert!(matches!(doc.set("list/7", 0), Err(Error::InvalidPath { .. })));
        assert_eq!(doc.remove("list/0")?, Some(Node::Int(1)));
        assert_eq!(doc.get("list"), Some(Node::seq([20, 30])));
        assert_eq!(doc.remove("missing/key")?, None);
        Ok(())
    }

    #[test]
    fn test_history_append_and_list() -> Result<()> {
        let mut doc = Document::new();
        doc.append_history("created")?;
        doc.append_history("calibrated")?;
        let history = doc.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].description, "calibrated");
        Ok(())
    }

    #[test]
    fn test_write_and_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("sample.tsr");
        let mut doc = sample()?;
        doc.append_history("written by test")?;
        doc.write(&path, &WriteOptions::default())?;

        let back = Document::open(&path, &OpenOptions::new())?;
        assert_eq!(back.get("meta/name"), Some(Node::from("m31")));
        assert_eq!(back.block_count(), 1);
        assert_eq!(back.history().len(), 1);
        let array = back.get("data").and_then(|n| n.as_array().cloned()).unwrap();
        assert_eq!(array.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(back.warnings().is_empty());
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_tree_mutation() -> Result<()> {
        let mut bytes = Vec::new();
        sample()?.write_to(&mut bytes, &WriteOptions::default())?;
        let mut doc = Document::from_bytes(bytes, &OpenOptions::new().mode(OpenMode::ReadOnly))?;
        assert!(matches!(doc.set("meta/name", "x"), Err(Error::ReadOnlyViolation { .. })));
        assert!(matches!(doc.append_history("x"), Err(Error::ReadOnlyViolation { .. })));
        assert!(matches!(
            doc.set_compression("data", Compression::Zstd),
            Err(Error::ReadOnlyViolation { .. })
        ));

        // Handles taken from the tree are frozen too
        let meta = doc.get("meta").unwrap();
        assert!(matches!(meta.as_mapping().unwrap().write(), Err(Error::ReadOnlyViolation { .. })));
        assert_eq!(doc.get("meta/name"), Some(Node::from("m31")));
        Ok(())
    }

    #[test]
    fn test_update_requires_update_mode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("sample.tsr");
        sample()?.write(&path, &WriteOptions::default())?;
        let mut doc = Document::open(&path, &OpenOptions::new())?;
        assert!(matches!(doc.update(&WriteOptions::default()), Err(Error::ReadOnlyViolation { .. })));
        Ok(())
    }

    #[test]
    fn test_set_compression_requires_array() -> Result<()> {
        let mut doc = sample()?;
        doc.set_compression("data", Compression::Zstd)?;
        assert!(matches!(
            doc.set_compression("meta/name", Compression::Zstd),
            Err(Error::InvalidPath { .. })
        ));
        assert!(matches!(
            doc.set_compression("data", Compression::Custom("lzma".into())),
            Err(Error::CompressionUnsupported { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_non_mapping_root_rejected() {
        let bytes = format!("{}--- [1, 2]\n...\n", crate::container::header_lines());
        let err = Document::from_bytes(bytes.into_bytes(), &OpenOptions::new()).unwrap_err();
        assert!(matches!(err, Error::TextSegmentParse { .. }));
    }
}
