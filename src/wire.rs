use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::binary::{
    BINARY_MAGIC, BINARY_VERSION_MAJOR, BINARY_VERSION_MINOR, BLOCK_EXTENSIONS,
    BLOCK_MAIN_PROGRAM, Binary, BinaryError,
};
use crate::extension::{ExtensionId, ExtensionRegistry};

const INDEX_RECORD_LEN: usize = 16;
const EXT_ID_NONE: u32 = u32::MAX;

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn read_slice<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], BinaryError> {
    let end = offset.checked_add(len).ok_or(BinaryError::Truncated(what))?;
    let slice = data.get(*offset..end).ok_or(BinaryError::Truncated(what))?;
    *offset = end;
    Ok(slice)
}

fn read_u32(data: &[u8], offset: &mut usize, what: &'static str) -> Result<u32, BinaryError> {
    let bytes = read_slice(data, offset, 4, what)?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16(data: &[u8], offset: &mut usize, what: &'static str) -> Result<u16, BinaryError> {
    let bytes = read_slice(data, offset, 2, what)?;
    Ok(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

/// Serialises the binary to `path`, committing atomically by renaming over
/// a temporary file.
///
/// Layout: native-endian header, a pre-reserved block index written last,
/// then the blocks in id order, each preceded by an `(id, size)` header.
/// All records start 4-byte aligned. Block 0 is regenerated from the link
/// table before anything is written.
pub fn save(
    binary: &mut Binary,
    registry: &ExtensionRegistry,
    path: &Path,
) -> Result<(), BinaryError> {
    // Give linked extensions the chance to flush deferred data into their
    // blocks first.
    let linked: Vec<ExtensionId> = binary.linked_extensions().map(|e| e.ext_id).collect();
    for ext_id in &linked {
        if let Some(ext) = registry.get(*ext_id) {
            let ext = ext.clone();
            ext.binary_save(binary, *ext_id)?;
        }
    }

    // Regenerate the extension-table block: a count followed by the linked
    // extension names, in link order.
    let names: Vec<String> = binary.linked_extensions().map(|e| e.name.clone()).collect();
    let previous = binary.set_active(BLOCK_EXTENSIONS);
    binary.block_clear(BLOCK_EXTENSIONS);
    binary.emit_integer(names.len() as u64);
    for name in &names {
        binary.emit_string(name.as_bytes());
    }
    binary.set_active(previous);

    let block_count = binary.block_count();
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(&BINARY_MAGIC.to_ne_bytes());
    out.extend_from_slice(&BINARY_VERSION_MAJOR.to_ne_bytes());
    out.extend_from_slice(&BINARY_VERSION_MINOR.to_ne_bytes());
    out.extend_from_slice(&(block_count as u32).to_ne_bytes());

    // Reserve the index slot; the records are patched in after the blocks
    // have been laid out.
    let index_offset = align4(out.len());
    out.resize(index_offset + INDEX_RECORD_LEN * block_count, 0);

    let mut block_offsets: Vec<u32> = Vec::with_capacity(block_count);
    for id in 0..block_count as u32 {
        let block = binary.block(id).ok_or(BinaryError::Truncated("block"))?;
        let header_offset = align4(out.len());
        out.resize(header_offset, 0);
        out.extend_from_slice(&id.to_ne_bytes());
        out.extend_from_slice(&(block.len() as u32).to_ne_bytes());
        let payload_offset = align4(out.len());
        out.resize(payload_offset, 0);
        out.extend_from_slice(block.bytes());
        block_offsets.push(header_offset as u32);
    }

    for id in 0..block_count as u32 {
        let block = binary.block(id).ok_or(BinaryError::Truncated("block"))?;
        let record = index_offset + id as usize * INDEX_RECORD_LEN;
        out[record..record + 4].copy_from_slice(&id.to_ne_bytes());
        out[record + 4..record + 8].copy_from_slice(&(block.len() as u32).to_ne_bytes());
        out[record + 8..record + 12].copy_from_slice(&block_offsets[id as usize].to_ne_bytes());
        let ext_id = block.ext_index().unwrap_or(EXT_ID_NONE);
        out[record + 12..record + 16].copy_from_slice(&ext_id.to_ne_bytes());
    }
    for id in 0..block_count as u32 {
        binary.block_set_file_offset(id, block_offsets[id as usize]);
    }

    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = std::path::PathBuf::from(temp);
    if let Err(err) = fs::write(&temp, &out) {
        return Err(BinaryError::WriteFailed(format!("write {}: {err}", temp.display())));
    }
    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(BinaryError::WriteFailed(format!(
            "rename {} to {}: {err}",
            temp.display(),
            path.display()
        )));
    }

    binary.set_path(path.to_path_buf());
    binary.file_mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
    debug!(path = %path.display(), blocks = block_count, "saved sieve binary");
    Ok(())
}

/// Loads a binary from disk: validates the header, reads the block index,
/// relinks the extensions listed in block 0 by name, then runs the linked
/// extensions' load hooks. Every failure is clean; the caller recompiles.
pub fn open(
    path: &Path,
    registry: &ExtensionRegistry,
    script_name: Option<String>,
) -> Result<Binary, BinaryError> {
    registry.freeze();

    let metadata = fs::metadata(path)
        .map_err(|err| BinaryError::StatFailed(format!("{}: {err}", path.display())))?;
    let data = fs::read(path)
        .map_err(|err| BinaryError::OpenFailed(format!("{}: {err}", path.display())))?;

    let mut binary = Binary::new_empty(script_name, path.to_path_buf());
    binary.file_mtime = metadata.modified().ok();

    let mut offset = 0usize;
    let magic = read_u32(&data, &mut offset, "header")?;
    if magic != BINARY_MAGIC {
        if magic == BINARY_MAGIC.swap_bytes() {
            debug!(path = %path.display(), "rejecting binary with foreign byte order");
        } else {
            warn!(path = %path.display(), "binary has corrupted header magic {magic:08x}");
        }
        return Err(BinaryError::BadMagic(magic));
    }
    let major = read_u16(&data, &mut offset, "header")?;
    let minor = read_u16(&data, &mut offset, "header")?;
    if major != BINARY_VERSION_MAJOR || minor != BINARY_VERSION_MINOR {
        // Different version; the caller will have to recompile.
        return Err(BinaryError::BadVersion { major, minor });
    }
    let block_count = read_u32(&data, &mut offset, "header")?;
    if block_count == 0 {
        return Err(BinaryError::NoBlocks);
    }

    // Block index.
    for id in 0..block_count {
        offset = align4(offset);
        let found = read_u32(&data, &mut offset, "block index")?;
        if found != id {
            return Err(BinaryError::BadBlockId { expected: id, found });
        }
        let _size = read_u32(&data, &mut offset, "block index")?;
        let file_offset = read_u32(&data, &mut offset, "block index")?;
        let ext_id = read_u32(&data, &mut offset, "block index")?;
        let ext_index = if ext_id == EXT_ID_NONE { None } else { Some(ext_id) };
        binary.block_create_at(id, ext_index, file_offset);
    }

    // Block payloads, in id order.
    for id in 0..block_count {
        offset = align4(offset);
        let found = read_u32(&data, &mut offset, "block header")?;
        if found != id {
            return Err(BinaryError::BadBlockId { expected: id, found });
        }
        let size = read_u32(&data, &mut offset, "block header")? as usize;
        let payload = read_slice(&data, &mut offset, size, "block")?;
        binary.block_fill(id, payload.to_vec());
    }

    // Relink the extensions recorded in block 0 by name; any unknown name
    // fails the whole load.
    let block0 = binary.block(BLOCK_EXTENSIONS).ok_or(BinaryError::NoBlocks)?;
    let mut addr = 0usize;
    let count = block0.read_integer(&mut addr)?;
    let mut names = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let raw = block0.read_string(&mut addr)?;
        let name = String::from_utf8(raw.to_vec()).map_err(|_| BinaryError::BadString)?;
        names.push(name);
    }
    for name in names {
        let ext_id = registry
            .by_name(&name)
            .ok_or_else(|| BinaryError::UnknownExtension(name.clone()))?;
        binary.link_extension(registry, ext_id)?;
    }

    activate(&mut binary, registry)?;
    binary.mark_loaded();
    debug!(path = %path.display(), blocks = block_count, "loaded sieve binary");
    Ok(binary)
}

/// Makes the main program block active and runs the binary-load hooks:
/// preloaded extensions first, then the linked extensions in link order.
pub fn activate(binary: &mut Binary, registry: &ExtensionRegistry) -> Result<(), BinaryError> {
    binary.set_active(BLOCK_MAIN_PROGRAM);
    let preloaded: Vec<ExtensionId> = registry.preloaded().map(|(id, _)| id).collect();
    for id in preloaded {
        if let Some(ext) = registry.get(id) {
            let ext = ext.clone();
            ext.binary_load(binary, id)?;
        }
    }
    let linked: Vec<ExtensionId> = binary.linked_extensions().map(|e| e.ext_id).collect();
    for id in linked {
        if let Some(ext) = registry.get(id) {
            let ext = ext.clone();
            ext.binary_load(binary, id)?;
        }
    }
    Ok(())
}
