use std::sync::Arc;
use std::thread;

use nimbus_cas::Fingerprint;
use nimbus_config::testing::TestEnvironment;
use nimbus_vfs::{
    ConflictPolicy, Drive, ErrorKind, Node, ReferenceLedger, SqliteLedger, VfsError,
};

const ALICE: i64 = 100;
const BOB: i64 = 200;

fn open(env: &TestEnvironment) -> Drive {
    Drive::open(&env.config).unwrap()
}

fn ref_count(drive: &Drive, fp: &Fingerprint) -> u64 {
    let conn = drive.database().lock();
    SqliteLedger
        .get(&conn, fp)
        .unwrap()
        .map(|entry| entry.ref_count)
        .unwrap_or(0)
}

fn all_nodes(drive: &Drive, account: i64) -> Vec<Node> {
    let mut out = Vec::new();
    let mut stack = vec!["/".to_string()];
    while let Some(folder) = stack.pop() {
        for node in drive.list_children(account, &folder, 0, usize::MAX).unwrap() {
            if node.is_folder() {
                stack.push(node.path.clone());
            }
            out.push(node);
        }
    }
    out
}

#[test]
fn delete_folder_releases_content_and_space() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    let content = vec![b'r'; 100];
    let fp = Fingerprint::of(&content);

    drive.create_folder(ALICE, "/docs").unwrap();
    drive.upload(ALICE, "/docs/readme.txt", &content, None).unwrap();
    assert_eq!(drive.space(ALICE).unwrap().used, 100);
    assert_eq!(ref_count(&drive, &fp), 1);

    let report = drive.delete(ALICE, "/docs").unwrap();
    assert_eq!(report.nodes_removed, 2);
    assert_eq!(report.blobs_reclaimed, 1);
    assert_eq!(drive.space(ALICE).unwrap().used, 0);
    assert_eq!(ref_count(&drive, &fp), 0);
    assert!(!drive.blobs().exists(fp.as_str()));
}

#[test]
fn identical_uploads_from_two_accounts_share_one_blob() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 7) as u8).collect();
    let fp = Fingerprint::of(&content);

    drive.upload(ALICE, "/same.bin", &content, None).unwrap();
    drive.upload(BOB, "/copy-of-same.bin", &content, None).unwrap();

    assert_eq!(ref_count(&drive, &fp), 2);
    assert_eq!(drive.blobs().stats().unwrap().blob_count, 1);
    assert_eq!(drive.space(ALICE).unwrap().used, 1000);
    assert_eq!(drive.space(BOB).unwrap().used, 1000);

    drive.delete(ALICE, "/same.bin").unwrap();
    assert_eq!(ref_count(&drive, &fp), 1);
    assert!(drive.blobs().exists(fp.as_str()));
}

#[test]
fn create_file_needs_parent_folder() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    let content = [1u8; 64];

    let err = drive.upload(ALICE, "/a/b.txt", &content, None).unwrap_err();
    assert!(matches!(err, VfsError::ParentMissing(_)));
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(ref_count(&drive, &Fingerprint::of(&content)), 0);

    drive.create_folder(ALICE, "/a").unwrap();
    let node = drive.upload(ALICE, "/a/b.txt", &content, None).unwrap();
    assert_eq!(node.path, "/a/b.txt");
}

#[test]
fn delete_missing_path_is_noop() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    let report = drive.delete(ALICE, "/not/there").unwrap();
    assert_eq!(report.nodes_removed, 0);
}

#[test]
fn rename_folder_moves_descendants_but_not_siblings() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);

    drive.create_folder(ALICE, "/a").unwrap();
    drive.create_folder(ALICE, "/ab").unwrap();
    drive.upload(ALICE, "/a/inner.txt", &[1u8; 30], None).unwrap();
    drive.upload(ALICE, "/ab/other.txt", &[2u8; 30], None).unwrap();

    drive.rename(ALICE, "/a", "b").unwrap();

    assert!(drive.exists(ALICE, "/b/inner.txt").unwrap());
    assert!(!drive.exists(ALICE, "/a/inner.txt").unwrap());
    assert!(drive.exists(ALICE, "/ab/other.txt").unwrap());
}

#[test]
fn root_cannot_be_renamed_moved_or_copied() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    drive.create_folder(ALICE, "/x").unwrap();

    for err in [
        drive.rename(ALICE, "/", "r").unwrap_err(),
        drive.move_to(ALICE, "/", "/x").unwrap_err(),
        drive.copy_to(ALICE, "/", "/x").unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

#[test]
fn concurrent_increments_count_every_reference() {
    const WRITERS: usize = 16;

    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);
    let db = drive.database().clone();
    let fp = Fingerprint::of(&[0xAB; 512]);

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let db = db.clone();
            let fp = fp.clone();
            thread::spawn(move || {
                db.with_immediate_tx(|tx| SqliteLedger.insert_or_increment(tx, &fp, 512))
                    .unwrap()
            })
        })
        .collect();

    let created: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().unwrap()))
        .sum();

    assert_eq!(created, 1);
    assert_eq!(ref_count(&drive, &fp), WRITERS as u64);

    let conn = db.lock();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM contents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);
}

#[test]
fn concurrent_uploads_across_accounts_dedup() {
    const ACCOUNTS: i64 = 8;

    let env = TestEnvironment::new().unwrap();
    let drive = Arc::new(open(&env));
    let content: Arc<Vec<u8>> = Arc::new(vec![0x5A; 10_000]);

    let handles: Vec<_> = (0..ACCOUNTS)
        .map(|account| {
            let drive = Arc::clone(&drive);
            let content = Arc::clone(&content);
            thread::spawn(move || {
                drive
                    .upload(account, "/shared.dat", &content, Some(ConflictPolicy::Strict))
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let fp = Fingerprint::of(&content);
    assert_eq!(ref_count(&drive, &fp), ACCOUNTS as u64);
    assert_eq!(drive.blobs().stats().unwrap().blob_count, 1);
}

#[test]
fn concurrent_delete_and_reupload_never_lose_bytes() {
    const ROUNDS: usize = 20;

    let env = TestEnvironment::new().unwrap();
    let drive = Arc::new(open(&env));
    let content: Arc<Vec<u8>> = Arc::new(vec![0x33; 2048]);
    let fp = Fingerprint::of(&content);

    let deleter = {
        let drive = Arc::clone(&drive);
        let content = Arc::clone(&content);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                drive
                    .upload(ALICE, "/churn", &content, Some(ConflictPolicy::Replace))
                    .unwrap();
                drive.delete(ALICE, "/churn").unwrap();
            }
        })
    };
    let uploader = {
        let drive = Arc::clone(&drive);
        let content = Arc::clone(&content);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                drive
                    .upload(BOB, "/keep", &content, Some(ConflictPolicy::Replace))
                    .unwrap();
            }
        })
    };
    deleter.join().unwrap();
    uploader.join().unwrap();

    // Bob still references the content, so its bytes must be readable.
    assert_eq!(ref_count(&drive, &fp), 1);
    let (_, mut file) = drive.open_file(BOB, "/keep").unwrap();
    let mut read = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut read).unwrap();
    assert_eq!(read, *content);
}

#[test]
fn tree_and_ledger_stay_consistent_under_mixed_mutations() {
    let env = TestEnvironment::new().unwrap();
    let drive = open(&env);

    // Small deterministic generator so the sequence is reproducible.
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move |bound: usize| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % bound as u64) as usize
    };

    let folders = ["/", "/a", "/b", "/a/c"];
    for folder in &folders[1..] {
        drive.create_folder(ALICE, folder).unwrap();
    }

    for step in 0..200 {
        let folders: Vec<String> = std::iter::once("/".to_string())
            .chain(
                all_nodes(&drive, ALICE)
                    .into_iter()
                    .filter(|n| n.is_folder())
                    .map(|n| n.path),
            )
            .collect();
        let nodes = all_nodes(&drive, ALICE);
        let folder = &folders[next(folders.len())];

        let result = match next(6) {
            0 | 1 => {
                let data = vec![(step % 5) as u8; 40 + step % 3];
                let path = format!("{}/f{}", folder.trim_end_matches('/'), next(4));
                drive.upload(ALICE, &path, &data, None).map(|_| ())
            }
            2 => {
                let path = format!("{}/d{}", folder.trim_end_matches('/'), next(3));
                drive.create_folder(ALICE, &path).map(|_| ())
            }
            3 if !nodes.is_empty() => {
                let node = &nodes[next(nodes.len())];
                drive.move_to(ALICE, &node.path, folder).map(|_| ())
            }
            // Cap growth: each folder copy can double the tree.
            4 if !nodes.is_empty() && nodes.len() < 150 => {
                let node = &nodes[next(nodes.len())];
                drive.copy_to(ALICE, &node.path, folder).map(|_| ())
            }
            _ if !nodes.is_empty() => {
                let node = &nodes[next(nodes.len())];
                drive.delete(ALICE, &node.path).map(|_| ())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            assert_ne!(e.kind(), ErrorKind::Storage, "step {}: {}", step, e);
        }
    }

    // Every node's path is its parent's path plus its name.
    let nodes = all_nodes(&drive, ALICE);
    for node in &nodes {
        let parent = node.path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let parent = if parent.is_empty() { "/" } else { parent };
        let parent_node = drive.get(ALICE, parent).unwrap().expect("parent exists");
        assert!(parent_node.is_folder());
        assert_eq!(Some(parent_node.id), node.parent);
    }

    // Ledger counts match the number of file nodes per fingerprint.
    let mut expected = std::collections::HashMap::new();
    for node in nodes.iter().filter(|n| n.is_file()) {
        *expected.entry(node.fingerprint.clone().unwrap()).or_insert(0u64) += 1;
    }
    for (fp, count) in &expected {
        assert_eq!(ref_count(&drive, fp), *count);
        assert!(drive.blobs().exists(fp.as_str()));
    }
    let rows: i64 = drive
        .database()
        .lock()
        .query_row("SELECT COUNT(*) FROM contents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows as usize, expected.len());
    assert_eq!(drive.blobs().stats().unwrap().blob_count, expected.len() as u64);
}
