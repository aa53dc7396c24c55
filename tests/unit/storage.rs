//! Unit tests for storage backends and key layout
//!
//! Every backend runs the same behavioural checks; the archiver and snapshot engine
//! rely on identical semantics whichever backend a cluster is configured with.

use std::sync::Arc;

use bytes::Bytes;
use object_store::memory::InMemory;

use postgres_guardian::cluster::model::ClusterKey;
use postgres_guardian::crd::StorageBackend;
use postgres_guardian::storage::layout::{
    archive_prefix, cluster_prefix, restore_prefix, snapshot_prefix, snapshots_prefix,
};
use postgres_guardian::storage::{
    BackendResolver, BlobStore, LocalStore, MemoryResolver, MemoryStore, ObjectStoreBackend,
    StorageError,
};

use crate::common::*;

async fn exercise_store(store: &dyn BlobStore) {
    store
        .put("guardian/demo/a/archive", "000000010000000000000001", Bytes::from("seg1"))
        .await
        .unwrap();
    store
        .put("guardian/demo/a/archive", "000000010000000000000002", Bytes::from("seg2"))
        .await
        .unwrap();
    store
        .put("guardian/demo/a-2/archive", "000000010000000000000001", Bytes::from("other"))
        .await
        .unwrap();

    // Listing is scoped to the directory and sorted
    assert_eq!(
        store.list("guardian/demo/a/archive").await.unwrap(),
        vec!["000000010000000000000001", "000000010000000000000002"]
    );
    assert_eq!(store.list("guardian/demo/a").await.unwrap().len(), 2);
    assert!(store.list("guardian/demo/missing").await.unwrap().is_empty());

    assert_eq!(
        store
            .get("guardian/demo/a/archive", "000000010000000000000002")
            .await
            .unwrap(),
        Bytes::from("seg2")
    );
    assert!(matches!(
        store.get("guardian/demo/a/archive", "nope").await,
        Err(StorageError::NotFound(_))
    ));

    // Overwrite replaces
    store
        .put("guardian/demo/a/archive", "000000010000000000000002", Bytes::from("seg2b"))
        .await
        .unwrap();
    assert_eq!(
        store
            .get("guardian/demo/a/archive", "000000010000000000000002")
            .await
            .unwrap(),
        Bytes::from("seg2b")
    );

    // Prefix deletion leaves the sibling cluster alone
    assert_eq!(store.delete_prefix("guardian/demo/a").await.unwrap(), 2);
    assert!(store.list("guardian/demo/a").await.unwrap().is_empty());
    assert_eq!(
        store
            .get("guardian/demo/a-2/archive", "000000010000000000000001")
            .await
            .unwrap(),
        Bytes::from("other")
    );

    // Deleting a missing key is not an error
    store
        .delete("guardian/demo/a/archive", "000000010000000000000001")
        .await
        .unwrap();

    assert!(matches!(
        store.put("guardian", "../escape", Bytes::new()).await,
        Err(StorageError::InvalidKey(_))
    ));
}

// =============================================================================
// Backends
// =============================================================================

mod backend_tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_object_store_backend() {
        let store = ObjectStoreBackend::new(Arc::new(InMemory::new()), "mem");
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_local_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalStore::open(dir.path()).await.unwrap();
            store.put("a", "b", Bytes::from("kept")).await.unwrap();
        }
        let reopened = LocalStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("a", "b").await.unwrap(), Bytes::from("kept"));
    }

    #[tokio::test]
    async fn test_local_store_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            LocalStore::open(&file).await,
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tamper_only_touches_existing_objects() {
        let store = MemoryStore::new();
        store.put("p", "k", Bytes::from("v")).await.unwrap();
        assert!(store.tamper("p/k", Bytes::from("x")));
        assert!(!store.tamper("p/missing", Bytes::from("x")));
        assert_eq!(store.get("p", "k").await.unwrap(), Bytes::from("x"));
        assert_eq!(store.len(), 1);
    }
}

// =============================================================================
// Resolution
// =============================================================================

mod resolver_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_container() {
        let resolver = MemoryResolver::new();
        let err = resolver
            .open("demo", &bucket("missing"))
            .await
            .err()
            .unwrap();
        assert_eq!(err, StorageError::ContainerNotFound("missing".to_string()));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_containers_are_shared_by_name() {
        let resolver = MemoryResolver::new();
        let created = resolver.create_container("wal");
        let opened = resolver.open("demo", &bucket("wal")).await.unwrap();
        opened.put("x", "y", Bytes::from("z")).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(resolver.container("wal").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_without_variant() {
        let resolver = MemoryResolver::new();
        let err = resolver
            .open("demo", &StorageBackend::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}

// =============================================================================
// Layout
// =============================================================================

mod layout_tests {
    use super::*;

    #[test]
    fn test_prefixes_under_default_root() {
        let key = ClusterKey::new("demo", "a");
        let backend = bucket("b");
        assert_eq!(cluster_prefix(&backend, &key), "guardian/demo/a");
        assert_eq!(archive_prefix(&backend, &key), "guardian/demo/a/archive");
        assert_eq!(snapshots_prefix(&backend, &key), "guardian/demo/a/snapshots");
        assert_eq!(
            snapshot_prefix(&backend, &key, "nightly"),
            "guardian/demo/a/snapshots/nightly"
        );
    }

    #[test]
    fn test_backend_prefix_replaces_root() {
        let key = ClusterKey::new("demo", "a");
        let backend = StorageBackend::s3("b", Some("/team/pg/"));
        assert_eq!(archive_prefix(&backend, &key), "team/pg/demo/a/archive");
        assert_eq!(restore_prefix(&backend), "team/pg");
    }

    #[test]
    fn test_similar_names_do_not_nest() {
        let backend = bucket("b");
        let a = cluster_prefix(&backend, &ClusterKey::new("demo", "a"));
        let a2 = cluster_prefix(&backend, &ClusterKey::new("demo", "a-2"));
        assert!(!a2.starts_with(&format!("{}/", a)));
    }
}
