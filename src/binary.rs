use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::extension::{ExtensionId, ExtensionRegistry};

/// Identifies native byte order on disk. The byte-reversed form is distinct,
/// so a binary written on a foreign-endian host is rejected instead of being
/// misread.
pub const BINARY_MAGIC: u32 = 0x5356_4231;

pub const BINARY_VERSION_MAJOR: u16 = 1;
pub const BINARY_VERSION_MINOR: u16 = 0;

/// Block 0 holds the extension link table, block 1 the main program.
pub const BLOCK_EXTENSIONS: u32 = 0;
pub const BLOCK_MAIN_PROGRAM: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BinaryError {
    OpenFailed(String),
    StatFailed(String),
    Truncated(&'static str),
    BadMagic(u32),
    BadVersion { major: u16, minor: u16 },
    UnknownExtension(String),
    BadBlockId { expected: u32, found: u32 },
    BadString,
    BadVarint,
    NoBlocks,
    WriteFailed(String),
    RegistryFrozen(String),
}

impl std::fmt::Display for BinaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryError::OpenFailed(message) => write!(f, "open failed: {message}"),
            BinaryError::StatFailed(message) => write!(f, "stat failed: {message}"),
            BinaryError::Truncated(what) => write!(f, "binary truncated reading {what}"),
            BinaryError::BadMagic(found) => {
                if *found == BINARY_MAGIC.swap_bytes() {
                    write!(f, "binary has foreign byte order (magic {found:08x})")
                } else {
                    write!(f, "corrupt binary header (magic {found:08x})")
                }
            }
            BinaryError::BadVersion { major, minor } => {
                write!(f, "unsupported binary version {major}.{minor}")
            }
            BinaryError::UnknownExtension(name) => {
                write!(f, "binary requires unknown extension '{name}'")
            }
            BinaryError::BadBlockId { expected, found } => {
                write!(f, "block {expected} has unexpected id {found}")
            }
            BinaryError::BadString => write!(f, "malformed string in binary"),
            BinaryError::BadVarint => write!(f, "malformed integer in binary"),
            BinaryError::NoBlocks => write!(f, "binary contains no blocks"),
            BinaryError::WriteFailed(message) => write!(f, "binary save failed: {message}"),
            BinaryError::RegistryFrozen(name) => {
                write!(f, "extension '{name}' registered after registry freeze")
            }
        }
    }
}

impl std::error::Error for BinaryError {}

/// A contiguous byte buffer within a binary, addressable by id. Read-only
/// once the binary is loaded; append-only through the binary's emit
/// interface while generating.
pub struct Block {
    id: u32,
    ext_index: Option<u32>,
    buf: Vec<u8>,
    file_offset: u32,
}

impl Block {
    fn new(id: u32) -> Self {
        Self { id, ext_index: None, buf: Vec::with_capacity(64), file_offset: 0 }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Local index of the owning extension, `None` for system blocks.
    pub fn ext_index(&self) -> Option<u32> {
        self.ext_index
    }

    /// File offset of the block header, recorded at save/load time.
    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_byte(&self, address: &mut usize) -> Result<u8, BinaryError> {
        let byte = *self.buf.get(*address).ok_or(BinaryError::Truncated("byte"))?;
        *address += 1;
        Ok(byte)
    }

    /// Fixed 4-byte big-endian two's complement jump offset.
    pub fn read_offset(&self, address: &mut usize) -> Result<i32, BinaryError> {
        let end = address.checked_add(4).ok_or(BinaryError::Truncated("offset"))?;
        let bytes = self.buf.get(*address..end).ok_or(BinaryError::Truncated("offset"))?;
        let offset = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        *address = end;
        Ok(offset)
    }

    /// Big-endian base-128 varint, bounded by 64 bits. Supplying more bits
    /// than fit is a corruption error, not a silent truncation.
    pub fn read_integer(&self, address: &mut usize) -> Result<u64, BinaryError> {
        let mut value: u64 = 0;
        let mut groups = 0;
        loop {
            let byte = self.read_byte(address).map_err(|_| BinaryError::BadVarint)?;
            groups += 1;
            if groups > 10 || value >> 57 != 0 {
                return Err(BinaryError::BadVarint);
            }
            value = (value << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// `varint(length) · bytes · 0x00`; the trailing NUL is verified.
    pub fn read_string(&self, address: &mut usize) -> Result<&[u8], BinaryError> {
        let len = self.read_integer(address)? as usize;
        let end = address.checked_add(len).ok_or(BinaryError::BadString)?;
        let bytes = self.buf.get(*address..end).ok_or(BinaryError::BadString)?;
        *address = end;
        if self.read_byte(address).map_err(|_| BinaryError::BadString)? != 0 {
            return Err(BinaryError::BadString);
        }
        Ok(bytes)
    }
}

/// An extension linked into one particular binary. Local indices are what
/// the bytecode refers to; the global id resolves through the registry.
pub struct LinkedExtension {
    pub index: u32,
    pub ext_id: ExtensionId,
    pub name: String,
    pub block_id: Option<u32>,
    context: Option<Box<dyn Any>>,
}

/// In-memory bytecode container: an ordered sequence of blocks, an
/// extension link table, and the emit/read codec over the active block.
pub struct Binary {
    script_name: Option<String>,
    path: Option<PathBuf>,
    blocks: Vec<Block>,
    active: usize,
    linked: Vec<LinkedExtension>,
    ext_index: HashMap<ExtensionId, usize>,
    loaded: bool,
    pub(crate) file_mtime: Option<SystemTime>,
}

impl Binary {
    /// A fresh binary ready for generation: the extension table block and
    /// the main program block exist, the main block is active.
    pub fn new(script_name: Option<String>) -> Self {
        let mut binary = Self {
            script_name,
            path: None,
            blocks: Vec::with_capacity(3),
            active: 0,
            linked: Vec::new(),
            ext_index: HashMap::new(),
            loaded: false,
            file_mtime: None,
        };
        let ext_block = binary.block_create();
        debug_assert_eq!(ext_block, BLOCK_EXTENSIONS);
        let main = binary.block_create();
        binary.set_active(main);
        binary
    }

    pub(crate) fn new_empty(script_name: Option<String>, path: PathBuf) -> Self {
        Self {
            script_name,
            path: Some(path),
            blocks: Vec::new(),
            active: 0,
            linked: Vec::new(),
            ext_index: HashMap::new(),
            loaded: true,
            file_mtime: None,
        }
    }

    pub fn script_name(&self) -> Option<&str> {
        self.script_name.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Whether this binary was read from disk rather than live-generated.
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// A loaded binary is up to date when it is at least as new as its
    /// script source. A live-generated binary always is.
    pub fn up_to_date(&self, script_mtime: Option<SystemTime>) -> bool {
        match (self.file_mtime, script_mtime) {
            (Some(bin), Some(script)) => bin >= script,
            _ => !self.loaded || script_mtime.is_none(),
        }
    }

    /* Block management */

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: u32) -> Option<&Block> {
        self.blocks.get(id as usize)
    }

    pub fn block_create(&mut self) -> u32 {
        let id = self.blocks.len() as u32;
        self.blocks.push(Block::new(id));
        id
    }

    pub(crate) fn block_create_at(&mut self, id: u32, ext_index: Option<u32>, file_offset: u32) {
        debug_assert_eq!(id as usize, self.blocks.len());
        let mut block = Block::new(id);
        block.ext_index = ext_index;
        block.file_offset = file_offset;
        self.blocks.push(block);
    }

    pub(crate) fn block_fill(&mut self, id: u32, bytes: Vec<u8>) {
        self.blocks[id as usize].buf = bytes;
    }

    pub(crate) fn block_set_file_offset(&mut self, id: u32, offset: u32) {
        self.blocks[id as usize].file_offset = offset;
    }

    pub fn block_clear(&mut self, id: u32) {
        if let Some(block) = self.blocks.get_mut(id as usize) {
            block.buf.clear();
        }
    }

    /// Makes `id` the target of all emit operations, returning the
    /// previously active block id.
    pub fn set_active(&mut self, id: u32) -> u32 {
        let old = self.active as u32;
        if (id as usize) < self.blocks.len() {
            self.active = id as usize;
        }
        old
    }

    pub fn active_block(&self) -> u32 {
        self.active as u32
    }

    /* Extension linking */

    /// Links a regular extension into this binary, returning its local
    /// index. Linking is idempotent per extension.
    pub fn link_extension(
        &mut self,
        registry: &ExtensionRegistry,
        ext_id: ExtensionId,
    ) -> Result<u32, BinaryError> {
        if let Some(&slot) = self.ext_index.get(&ext_id) {
            return Ok(self.linked[slot].index);
        }
        let ext = registry
            .get(ext_id)
            .ok_or_else(|| BinaryError::UnknownExtension(format!("id {}", ext_id.0)))?;
        let index = self.linked.len() as u32;
        self.linked.push(LinkedExtension {
            index,
            ext_id,
            name: ext.name().to_string(),
            block_id: None,
            context: None,
        });
        self.ext_index.insert(ext_id, self.linked.len() - 1);
        Ok(index)
    }

    pub fn linked_extensions(&self) -> impl Iterator<Item = &LinkedExtension> {
        self.linked.iter()
    }

    pub fn linked_extension(&self, index: u32) -> Option<&LinkedExtension> {
        self.linked.get(index as usize)
    }

    pub fn extension_index(&self, ext_id: ExtensionId) -> Option<u32> {
        self.ext_index.get(&ext_id).map(|&slot| self.linked[slot].index)
    }

    pub fn extension_count(&self) -> usize {
        self.linked.len()
    }

    /// Per-binary context data owned by an extension's link entry.
    pub fn set_extension_context(&mut self, ext_id: ExtensionId, context: Box<dyn Any>) {
        if let Some(&slot) = self.ext_index.get(&ext_id) {
            self.linked[slot].context = Some(context);
        }
    }

    pub fn extension_context<T: 'static>(&self, ext_id: ExtensionId) -> Option<&T> {
        let slot = *self.ext_index.get(&ext_id)?;
        self.linked[slot].context.as_ref()?.downcast_ref::<T>()
    }

    /// Allocates a block owned by the given extension; the first such block
    /// becomes the extension's main block.
    pub fn create_extension_block(&mut self, ext_id: ExtensionId) -> Option<u32> {
        let slot = *self.ext_index.get(&ext_id)?;
        let local_index = self.linked[slot].index;
        let id = self.block_create();
        self.blocks[id as usize].ext_index = Some(local_index);
        if self.linked[slot].block_id.is_none() {
            self.linked[slot].block_id = Some(id);
        }
        Some(id)
    }

    /* Emission: all of these act on the active block. */

    pub fn code_size(&self) -> usize {
        self.blocks[self.active].buf.len()
    }

    pub fn emit_data(&mut self, data: &[u8]) -> usize {
        let address = self.code_size();
        self.blocks[self.active].buf.extend_from_slice(data);
        address
    }

    pub fn emit_byte(&mut self, byte: u8) -> usize {
        self.emit_data(&[byte])
    }

    /// Big-endian base-128 varint with the continuation bit in the high bit
    /// of every non-terminal byte.
    pub fn emit_integer(&mut self, value: u64) -> usize {
        let mut buf = [0u8; 10];
        let mut pos = buf.len() - 1;
        let mut rest = value;
        buf[pos] = (rest & 0x7f) as u8;
        rest >>= 7;
        while rest > 0 {
            pos -= 1;
            buf[pos] = (rest & 0x7f) as u8 | 0x80;
            rest >>= 7;
        }
        self.emit_data(&buf[pos..])
    }

    /// Fixed 4-byte big-endian offset slot; combine with `resolve_offset`
    /// to back-patch forward jumps.
    pub fn emit_offset(&mut self, offset: i32) -> usize {
        self.emit_data(&offset.to_be_bytes())
    }

    /// Patches the offset slot at `address` to point at the current end of
    /// code, relative to the slot's first byte.
    pub fn resolve_offset(&mut self, address: usize) {
        let offset = (self.code_size() - address) as i32;
        self.patch_data(address, &offset.to_be_bytes());
    }

    pub(crate) fn patch_data(&mut self, address: usize, data: &[u8]) {
        self.blocks[self.active].buf[address..address + data.len()].copy_from_slice(data);
    }

    pub fn emit_string(&mut self, bytes: &[u8]) -> usize {
        let address = self.emit_integer(bytes.len() as u64);
        self.emit_data(bytes);
        self.emit_byte(0);
        address
    }
}
