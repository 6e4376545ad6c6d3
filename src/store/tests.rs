use super::*;
use crate::image::{ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_LAYER};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn dir_engine() -> (TempDir, DirEngine) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("layout");
    create_layout(&root, StoreConfig::default()).unwrap();
    let engine = DirEngine::open(&root, StoreConfig::default()).unwrap();
    (temp_dir, engine)
}

/// Runs `check` against a fresh engine of each backend.
fn for_each_engine<F: Fn(&dyn Engine)>(check: F) {
    let (_temp_dir, engine) = dir_engine();
    check(&engine);
    check(&MemoryEngine::default());
}

fn manifest_descriptor(engine: &dyn Engine, ctx: &CancelToken, tag: &str) -> Descriptor {
    let (digest, size) = engine
        .put_blob_json(ctx, &json!({"schemaVersion": 2, "tag": tag}))
        .unwrap();
    Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, digest, size)
}

#[test]
fn test_put_get_blob_idempotent() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        let (d1, s1) = engine.put_blob(&ctx, &mut &b"hello"[..]).unwrap();
        let (d2, s2) = engine.put_blob(&ctx, &mut &b"hello"[..]).unwrap();
        assert_eq!(d1, d2);
        assert_eq!((s1, s2), (5, 5));
        assert_eq!(
            d1.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        assert_eq!(engine.read_blob(&ctx, &d1).unwrap(), b"hello");
        assert_eq!(engine.list_blobs(&ctx).unwrap(), vec![d1]);
    });
}

#[test]
fn test_put_blob_json_is_canonical() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b: serde_json::Value =
            serde_json::from_str(r#"{ "a": { "x": null, "y": [1, 2] }, "b": 1 }"#).unwrap();
        let (da, _) = engine.put_blob_json(&ctx, &a).unwrap();
        let (db, _) = engine.put_blob_json(&ctx, &b).unwrap();
        assert_eq!(da, db);
        assert_eq!(
            engine.read_blob(&ctx, &da).unwrap(),
            br#"{"a":{"x":null,"y":[1,2]},"b":1}"#
        );
    });
}

#[test]
fn test_missing_and_deleted_blobs_are_not_found() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        let missing = DigestAlgorithm::Sha256.digest_bytes(b"never written");
        assert!(engine.get_blob(&ctx, &missing).err().unwrap().is_not_found());

        let (digest, _) = engine.put_blob(&ctx, &mut &b"doomed"[..]).unwrap();
        engine.delete_blob(&ctx, &digest).unwrap();
        engine.delete_blob(&ctx, &digest).unwrap();
        assert!(engine.get_blob(&ctx, &digest).err().unwrap().is_not_found());
        assert!(engine.list_blobs(&ctx).unwrap().is_empty());
    });
}

#[test]
fn test_index_round_trip() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        assert_eq!(engine.get_index(&ctx).unwrap(), Index::default());

        let mut index = Index::default();
        index.manifests.push(manifest_descriptor(engine, &ctx, "a"));
        index
            .extra
            .insert("vendor.field".to_owned(), json!({"kept": true}));
        engine.put_index(&ctx, &index).unwrap();
        assert_eq!(engine.get_index(&ctx).unwrap(), index);
    });
}

#[test]
fn test_reference_semantics() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        let a = manifest_descriptor(engine, &ctx, "a");
        let b = manifest_descriptor(engine, &ctx, "b");

        engine.put_reference(&ctx, "latest", &a).unwrap();
        engine.put_reference(&ctx, "latest", &a).unwrap();
        assert!(matches!(
            engine.put_reference(&ctx, "latest", &b),
            Err(Error::Clobber(_))
        ));
        assert_eq!(engine.get_reference(&ctx, "latest").unwrap(), a);

        engine.update_reference(&ctx, "latest", &b).unwrap();
        assert_eq!(engine.get_reference(&ctx, "latest").unwrap(), b);
        engine.put_reference(&ctx, "v1", &a).unwrap();
        assert_eq!(
            engine.list_references(&ctx).unwrap(),
            vec!["latest".to_owned(), "v1".to_owned()]
        );

        // Only one index entry per name.
        let index = engine.get_index(&ctx).unwrap();
        assert_eq!(index.manifests.len(), 2);

        engine.delete_reference(&ctx, "latest").unwrap();
        engine.delete_reference(&ctx, "latest").unwrap();
        assert!(
            engine
                .get_reference(&ctx, "latest")
                .unwrap_err()
                .is_not_found()
        );
        // Blobs outlive their references.
        assert!(engine.get_blob(&ctx, &b.digest).is_ok());
    });
}

#[test]
fn test_resolve_reference_walks_nested_index() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        let manifest = manifest_descriptor(engine, &ctx, "nested");
        let (layer_digest, layer_size) = engine.put_blob(&ctx, &mut &b"not json"[..]).unwrap();
        let stray = Descriptor::new(MEDIA_TYPE_IMAGE_LAYER, layer_digest, layer_size);

        let nested = Index {
            manifests: vec![manifest.clone(), stray],
            ..Index::default()
        };
        let (nested_digest, nested_size) = engine.put_blob_json(&ctx, &nested).unwrap();
        let nested_desc = Descriptor::new(MEDIA_TYPE_IMAGE_INDEX, nested_digest, nested_size);
        engine.put_reference(&ctx, "multi", &nested_desc).unwrap();

        let paths = engine.resolve_reference(&ctx, "multi").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].descriptor(), &manifest);
        assert_eq!(paths[0].root().digest, nested_desc.digest);
        assert_eq!(paths[0].root().ref_name(), Some("multi"));

        assert!(engine.resolve_reference(&ctx, "nope").unwrap().is_empty());
    });
}

#[test]
fn test_cancelled_token_stops_operations() {
    for_each_engine(|engine| {
        let ctx = CancelToken::new();
        ctx.cancel();
        assert!(matches!(
            engine.put_blob(&ctx, &mut &b"x"[..]),
            Err(Error::Cancelled)
        ));
        assert!(matches!(engine.get_index(&ctx), Err(Error::Cancelled)));
        assert!(matches!(engine.list_blobs(&ctx), Err(Error::Cancelled)));
    });
}

#[test]
fn test_read_config_rejects_wrong_media_type() {
    let engine = MemoryEngine::default();
    let ctx = CancelToken::new();
    let manifest = manifest_descriptor(&engine, &ctx, "m");
    assert!(matches!(
        engine.read_config(&ctx, &manifest),
        Err(Error::Invalid(_))
    ));
    assert!(engine.read_manifest(&ctx, &manifest).is_err());
    let mut as_layer = manifest;
    as_layer.media_type = MEDIA_TYPE_IMAGE_LAYER.to_owned();
    assert!(
        engine
            .read_manifest(&ctx, &as_layer)
            .unwrap_err()
            .is_unknown_type()
    );
}

#[test]
fn test_memory_engine_close() {
    let mut engine = MemoryEngine::default();
    let ctx = CancelToken::new();
    engine.close().unwrap();
    assert!(matches!(engine.get_index(&ctx), Err(Error::Closed)));
    assert!(matches!(engine.close(), Err(Error::Closed)));
}

#[test]
fn test_open_requires_layout() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        DirEngine::open(temp_dir.path(), StoreConfig::default()),
        Err(Error::Invalid(_))
    ));

    fs::write(
        temp_dir.path().join("oci-layout"),
        r#"{"imageLayoutVersion":"2.0.0"}"#,
    )
    .unwrap();
    assert!(matches!(
        DirEngine::open(temp_dir.path(), StoreConfig::default()),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_create_layout_files() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("new");
    create_layout(&root, StoreConfig::default()).unwrap();

    assert_eq!(
        fs::read_to_string(root.join("oci-layout")).unwrap(),
        r#"{"imageLayoutVersion":"1.0.0"}"#
    );
    assert!(root.join("blobs").join("sha256").is_dir());
    let index: Index =
        serde_json::from_slice(&fs::read(root.join("index.json")).unwrap()).unwrap();
    assert!(index.manifests.is_empty());

    assert!(matches!(
        create_layout(&root, StoreConfig::default()),
        Err(Error::Clobber(_))
    ));
}

#[test]
fn test_dir_engine_blob_layout_on_disk() {
    let (temp_dir, engine) = dir_engine();
    let ctx = CancelToken::new();
    let (digest, _) = engine.put_blob(&ctx, &mut &b"on disk"[..]).unwrap();
    let path = temp_dir
        .path()
        .join("layout/blobs/sha256")
        .join(digest.encoded());
    assert_eq!(fs::read(path).unwrap(), b"on disk");
}

#[test]
fn test_dir_engine_detects_corruption() {
    let (temp_dir, engine) = dir_engine();
    let ctx = CancelToken::new();
    let (digest, _) = engine.put_blob(&ctx, &mut &b"pristine"[..]).unwrap();
    let path = temp_dir
        .path()
        .join("layout/blobs/sha256")
        .join(digest.encoded());
    fs::write(path, b"tampered").unwrap();

    assert!(matches!(
        engine.read_blob(&ctx, &digest),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_dir_engine_list_skips_stray_files() {
    let (temp_dir, engine) = dir_engine();
    let ctx = CancelToken::new();
    let (digest, _) = engine.put_blob(&ctx, &mut &b"real"[..]).unwrap();
    fs::write(temp_dir.path().join("layout/blobs/sha256/not-a-digest"), b"").unwrap();
    fs::create_dir_all(temp_dir.path().join("layout/blobs/md5")).unwrap();

    assert_eq!(engine.list_blobs(&ctx).unwrap(), vec![digest]);
}

#[test]
fn test_clean_removes_only_stale_temp_dirs() {
    let (temp_dir, engine) = dir_engine();
    let ctx = CancelToken::new();
    let root = temp_dir.path().join("layout");

    let mut other = DirEngine::open(&root, StoreConfig::default()).unwrap();
    let stale = root.join(".repack-stale");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("partial"), b"half a blob").unwrap();

    let (digest, _) = engine.put_blob(&ctx, &mut &b"keep me"[..]).unwrap();
    let layer = Descriptor::new(MEDIA_TYPE_IMAGE_LAYER, digest.clone(), 7);
    engine.put_reference(&ctx, "keep", &layer).unwrap();

    engine.clean(&ctx).unwrap();

    assert!(!stale.exists());
    let live: Vec<_> = fs::read_dir(&root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".repack-"))
        .collect();
    assert_eq!(live.len(), 2, "both live engines keep their temp dirs");

    // The other engine still works after a clean.
    assert!(other.put_blob(&ctx, &mut &b"still alive"[..]).is_ok());
    assert!(engine.get_blob(&ctx, &digest).is_ok());
    assert_eq!(engine.list_references(&ctx).unwrap(), vec!["keep".to_owned()]);

    other.close().unwrap();
    assert!(matches!(other.get_index(&ctx), Err(Error::Closed)));
    engine.clean(&ctx).unwrap();
}

#[test]
fn test_index_entry_keeps_ref_annotation() {
    let (_temp_dir, engine) = dir_engine();
    let ctx = CancelToken::new();
    let desc = manifest_descriptor(&engine, &ctx, "x");
    engine.put_reference(&ctx, "tagged", &desc).unwrap();
    let index = engine.get_index(&ctx).unwrap();
    assert_eq!(
        index.manifests[0].annotations.get(ANNOTATION_REF_NAME),
        Some(&"tagged".to_owned())
    );
}
