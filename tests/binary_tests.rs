mod common;
use common::*;

use std::sync::Arc;

use sieve_engine::binary::BLOCK_MAIN_PROGRAM;
use sieve_engine::extension::Extension;
use sieve_engine::wire;

fn emit_and_read_back(value: u64) -> u64 {
    let mut binary = Binary::new(None);
    binary.emit_integer(value);
    let block = binary.block(BLOCK_MAIN_PROGRAM).expect("main block exists");
    let mut address = 0;
    let read = block.read_integer(&mut address).expect("varint should read back");
    assert_eq!(address, block.len(), "read should consume the whole encoding");
    read
}

#[test]
fn varint_roundtrips_across_widths() {
    for value in [
        0u64,
        1,
        127,
        128,
        300,
        16383,
        16384,
        u64::from(u32::MAX),
        u64::MAX - 1,
        u64::MAX,
    ] {
        assert_eq!(emit_and_read_back(value), value);
    }
}

#[test]
fn varint_rejects_unterminated_and_overlong_encodings() {
    let mut binary = Binary::new(None);
    // Eleven continuation bytes supply more bits than a u64 holds.
    binary.emit_data(&[0xff; 11]);
    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = 0;
    assert_eq!(block.read_integer(&mut address), Err(BinaryError::BadVarint));

    // A continuation byte at the end of the block never terminates.
    let mut binary = Binary::new(None);
    binary.emit_data(&[0x81]);
    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = 0;
    assert_eq!(block.read_integer(&mut address), Err(BinaryError::BadVarint));

    // Zero-padded encodings longer than ten groups are rejected too.
    let mut binary = Binary::new(None);
    binary.emit_data(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = 0;
    assert_eq!(block.read_integer(&mut address), Err(BinaryError::BadVarint));
}

#[test]
fn string_codec_roundtrips_and_rejects_missing_nul() {
    let mut binary = Binary::new(None);
    binary.emit_string(b"fileinto");
    binary.emit_string(b"");
    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = 0;
    assert_eq!(block.read_string(&mut address).unwrap(), b"fileinto");
    assert_eq!(block.read_string(&mut address).unwrap(), b"");
    assert_eq!(address, block.len());

    // A length that runs past the block is corrupt.
    let mut binary = Binary::new(None);
    binary.emit_integer(200);
    binary.emit_data(b"short");
    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = 0;
    assert_eq!(block.read_string(&mut address), Err(BinaryError::BadString));
}

#[test]
fn offset_slots_resolve_to_forward_targets() {
    let mut binary = Binary::new(None);
    let slot = binary.emit_offset(0);
    binary.emit_data(&[0xaa; 13]);
    binary.resolve_offset(slot);

    let block = binary.block(BLOCK_MAIN_PROGRAM).unwrap();
    let mut address = slot;
    let offset = block.read_offset(&mut address).expect("offset should read back");
    assert_eq!(slot as i64 + i64::from(offset), block.len() as i64);
}

#[test]
fn active_block_switching_targets_emission() {
    let mut binary = Binary::new(None);
    assert_eq!(binary.active_block(), BLOCK_MAIN_PROGRAM);
    binary.emit_byte(0x01);

    let extra = binary.block_create();
    let previous = binary.set_active(extra);
    assert_eq!(previous, BLOCK_MAIN_PROGRAM);
    binary.emit_byte(0x02);
    binary.set_active(previous);

    assert_eq!(binary.block(BLOCK_MAIN_PROGRAM).unwrap().bytes(), &[0x01]);
    assert_eq!(binary.block(extra).unwrap().bytes(), &[0x02]);

    binary.block_clear(extra);
    assert!(binary.block(extra).unwrap().is_empty());
}

fn sample_binary(engine: &SieveEngine) -> Binary {
    let mut pb = builder(engine, "sample");
    pb.require("fileinto").expect("fileinto is registered");
    pb.require("imap4flags").expect("imap4flags is registered");
    pb.test_exists(&["Subject"]);
    pb.op_jmp_false("end");
    sieve_engine::ext::fileinto::emit(&mut pb, 3, "Work").expect("emit should succeed");
    pb.label("end").unwrap();
    pb.op_keep(4);
    pb.finish().expect("program should assemble")
}

#[test]
fn save_load_roundtrip_preserves_blocks_and_link_table() {
    let engine = SieveEngine::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sample.svbin");

    let mut binary = sample_binary(&engine);
    wire::save(&mut binary, engine.registry(), &path).expect("save should succeed");
    let loaded = wire::open(&path, engine.registry(), None).expect("load should succeed");

    assert!(loaded.loaded());
    assert_eq!(loaded.block_count(), binary.block_count());
    for id in 0..binary.block_count() as u32 {
        assert_eq!(
            loaded.block(id).unwrap().bytes(),
            binary.block(id).unwrap().bytes(),
            "block {id} should round-trip"
        );
    }

    let saved: Vec<(u32, String)> =
        binary.linked_extensions().map(|e| (e.index, e.name.clone())).collect();
    let reloaded: Vec<(u32, String)> =
        loaded.linked_extensions().map(|e| (e.index, e.name.clone())).collect();
    assert_eq!(saved, reloaded, "link table order must survive the round-trip");
}

#[test]
fn load_rejects_foreign_byte_order() {
    let engine = SieveEngine::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("endian.svbin");

    let mut binary = sample_binary(&engine);
    wire::save(&mut binary, engine.registry(), &path).expect("save should succeed");

    // Simulate a binary written on a host of the opposite endianness: the
    // magic reads back byte-reversed.
    let mut data = std::fs::read(&path).unwrap();
    data[0..4].reverse();
    std::fs::write(&path, &data).unwrap();

    let err = wire::open(&path, engine.registry(), None)
        .err()
        .expect("foreign byte order must be rejected");
    match err {
        BinaryError::BadMagic(found) => {
            assert_eq!(found, sieve_engine::BINARY_MAGIC.swap_bytes());
        }
        other => panic!("expected BadMagic, got {other:?}"),
    }
}

#[test]
fn load_rejects_version_mismatch_and_truncation() {
    let engine = SieveEngine::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("version.svbin");

    let mut binary = sample_binary(&engine);
    wire::save(&mut binary, engine.registry(), &path).expect("save should succeed");
    let data = std::fs::read(&path).unwrap();

    let mut bad_version = data.clone();
    bad_version[4..6].copy_from_slice(&9u16.to_ne_bytes());
    std::fs::write(&path, &bad_version).unwrap();
    assert!(matches!(
        wire::open(&path, engine.registry(), None),
        Err(BinaryError::BadVersion { major: 9, .. })
    ));

    std::fs::write(&path, &data[..20]).unwrap();
    assert!(matches!(
        wire::open(&path, engine.registry(), None),
        Err(BinaryError::Truncated(_))
    ));
}

#[test]
fn load_rejects_corrupt_block_index() {
    let engine = SieveEngine::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blockid.svbin");

    let mut binary = sample_binary(&engine);
    wire::save(&mut binary, engine.registry(), &path).expect("save should succeed");

    // The first index record sits right after the 12-byte header; give it
    // a wrong id.
    let mut data = std::fs::read(&path).unwrap();
    data[12..16].copy_from_slice(&7u32.to_ne_bytes());
    std::fs::write(&path, &data).unwrap();

    assert!(matches!(
        wire::open(&path, engine.registry(), None),
        Err(BinaryError::BadBlockId { expected: 0, found: 7 })
    ));
}

struct LocalExtension;

impl Extension for LocalExtension {
    fn name(&self) -> &'static str {
        "vnd.test.local"
    }
}

#[test]
fn load_rejects_unknown_extension() {
    // Compile against a registry that knows one extra extension...
    let mut registry = ExtensionRegistry::new();
    registry.register(Arc::new(LocalExtension)).expect("fresh registry accepts registrations");
    let registry = Arc::new(registry);

    let mut pb = ProgramBuilder::new(registry.clone(), Some("local"));
    pb.require("vnd.test.local").expect("extension is registered");
    pb.op_stop();
    let mut binary = pb.finish().expect("program should assemble");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("unknown.svbin");
    wire::save(&mut binary, &registry, &path).expect("save should succeed");

    // ...then load it in a stock engine that has never heard of it.
    let engine = SieveEngine::new();
    let err = wire::open(&path, engine.registry(), None)
        .err()
        .expect("unknown extension must fail the load");
    match err {
        BinaryError::UnknownExtension(name) => assert_eq!(name, "vnd.test.local"),
        other => panic!("expected UnknownExtension, got {other:?}"),
    }
}

#[test]
fn extension_blocks_record_their_owner() {
    let engine = SieveEngine::new();
    let mut binary = Binary::new(None);
    let ext_id = engine.registry().by_name("fileinto").expect("fileinto is registered");
    binary.link_extension(engine.registry(), ext_id).expect("link should succeed");

    let block = binary.create_extension_block(ext_id).expect("linked extension gets a block");
    assert_eq!(binary.block(block).unwrap().ext_index(), binary.extension_index(ext_id));

    let entry = binary
        .linked_extensions()
        .find(|e| e.ext_id == ext_id)
        .expect("fileinto is linked");
    assert_eq!(entry.block_id, Some(block));
}
