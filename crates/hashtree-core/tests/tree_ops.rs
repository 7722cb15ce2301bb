//! Directory editing and file reads over a shared store

use std::sync::Arc;

use hashtree_core::{
    Cid, DirEntry, HashTree, HashTreeConfig, HashTreeError, LinkType, MemoryStore, Store,
};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

async fn site(tree: &HashTree<MemoryStore>) -> Cid {
    let (index, index_size) = tree.put_file(b"<h1>home</h1>").await.unwrap();
    let (guide, guide_size) = tree.put_file(b"# Guide v1").await.unwrap();
    let docs = tree
        .put_directory(vec![DirEntry::from_cid("guide.md", &guide).with_size(guide_size)])
        .await
        .unwrap();
    tree.put_directory(vec![
        DirEntry::from_cid("index.html", &index).with_size(index_size),
        DirEntry::from_cid("docs", &docs)
            .with_size(guide_size)
            .with_link_type(LinkType::Dir),
    ])
    .await
    .unwrap()
}

async fn read(tree: &HashTree<MemoryStore>, root: &Cid, path: &str) -> Vec<u8> {
    let entry = tree.resolve(root, path).await.unwrap().expect("path exists");
    tree.read_file(&entry.cid).await.unwrap().expect("file exists")
}

#[tokio::test]
async fn nested_edit_produces_new_root_and_keeps_old() {
    let store = Arc::new(MemoryStore::new());
    let tree = HashTree::new(HashTreeConfig::new(store));
    let v1 = site(&tree).await;

    let (guide, size) = tree.put_file(b"# Guide v2, now longer").await.unwrap();
    let v2 = tree
        .set_entry(&v1, &["docs"], DirEntry::from_cid("guide.md", &guide).with_size(size))
        .await
        .unwrap();

    assert_ne!(v1.hash, v2.hash);
    assert_eq!(read(&tree, &v1, "docs/guide.md").await, b"# Guide v1");
    assert_eq!(read(&tree, &v2, "docs/guide.md").await, b"# Guide v2, now longer");

    let old_index = tree.resolve(&v1, "index.html").await.unwrap().unwrap();
    let new_index = tree.resolve(&v2, "index.html").await.unwrap().unwrap();
    assert_eq!(old_index.cid.hash, new_index.cid.hash);

    // parent sizes follow the edit
    let docs = tree.resolve(&v2, "docs").await.unwrap().unwrap();
    assert_eq!(docs.size, size);
}

#[tokio::test]
async fn add_and_remove_entries_keep_listing_sorted() {
    let store = Arc::new(MemoryStore::new());
    let tree = HashTree::new(HashTreeConfig::new(store));
    let root = site(&tree).await;

    let (css, css_size) = tree.put_file(b"body{}").await.unwrap();
    let root = tree
        .set_entry(&root, &[], DirEntry::from_cid("app.css", &css).with_size(css_size))
        .await
        .unwrap();
    let names: Vec<String> = tree
        .list_directory(&root)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["app.css", "docs", "index.html"]);

    let root = tree.remove_entry(&root, &["docs"], "guide.md").await.unwrap();
    assert!(tree.resolve(&root, "docs/guide.md").await.unwrap().is_none());
    assert!(tree.list_directory(&tree.resolve(&root, "docs").await.unwrap().unwrap().cid)
        .await
        .unwrap()
        .is_empty());

    let err = tree.remove_entry(&root, &["docs"], "guide.md").await.unwrap_err();
    assert!(matches!(err, HashTreeError::EntryNotFound(_)));
}

#[tokio::test]
async fn chunked_file_in_directory_reads_by_range() {
    let store = Arc::new(MemoryStore::new());
    let tree = HashTree::new(
        HashTreeConfig::new(store)
            .with_chunk_size(64)
            .with_max_links(4),
    );
    let data = pattern(1000, 7);
    let (file, size) = tree.put_file(&data).await.unwrap();
    assert_eq!(size, 1000);

    let root = tree
        .put_directory(vec![DirEntry::from_cid("video.bin", &file)
            .with_size(size)
            .with_link_type(LinkType::File)])
        .await
        .unwrap();
    let entry = tree.resolve(&root, "video.bin").await.unwrap().unwrap();
    assert_eq!(tree.file_size(&entry.cid).await.unwrap(), 1000);

    for (start, end) in [(0, 64), (60, 70), (255, 513), (990, 2000)] {
        let got = tree
            .read_file_range(&entry.cid, start, end)
            .await
            .unwrap()
            .unwrap();
        let end = end.min(1000) as usize;
        assert_eq!(got, data[start as usize..end], "range {start}..{end}");
    }
}

#[tokio::test]
async fn encrypted_and_public_trees_share_a_store() {
    let store = Arc::new(MemoryStore::new());
    let private = HashTree::new(HashTreeConfig::new(store.clone()));
    let public = HashTree::new(HashTreeConfig::new(store.clone()).public());

    let (a, _) = private.put_file(b"same bytes").await.unwrap();
    let blocks = store.len();
    let (b, _) = private.put_file(b"same bytes").await.unwrap();
    assert_eq!(a.hash, b.hash);
    assert_eq!(store.len(), blocks);

    let (p, _) = public.put_file(b"same bytes").await.unwrap();
    assert_ne!(p.hash, a.hash);
    assert!(p.key.is_none());
    assert_eq!(store.get(&p.hash).await.unwrap().unwrap(), b"same bytes");

    // hash without key reads ciphertext, not plaintext
    let raw = store.get(&a.hash).await.unwrap().unwrap();
    assert_ne!(raw, b"same bytes");
    assert_eq!(private.read_file(&a).await.unwrap().unwrap(), b"same bytes");
}

#[tokio::test]
async fn missing_chunk_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let tree = HashTree::new(HashTreeConfig::new(store.clone()).with_chunk_size(32));
    let (file, _) = tree.put_file(&pattern(100, 1)).await.unwrap();

    let node = tree.get_node(&file).await.unwrap().unwrap();
    store.delete(&node.links[1].hash).await.unwrap();

    let err = tree.read_file(&file).await.unwrap_err();
    assert!(matches!(err, HashTreeError::MissingBlock(_)));
    // the first chunk is still readable
    let head = tree.read_file_range(&file, 0, 32).await.unwrap().unwrap();
    assert_eq!(head, pattern(100, 1)[..32]);
}
