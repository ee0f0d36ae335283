#![forbid(unsafe_code)]
//! End-to-end engine tests against real image files.
//!
//! Every test formats a fresh image in a temp directory and drives the
//! public API only, the same way the shell does.

use mfs_core::Filesystem;
use mfs_error::FsError;
use std::path::PathBuf;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn image_path(dir: &TempDir) -> PathBuf {
    dir.path().join("fs.img")
}

fn formatted(dir: &TempDir, bytes: u64) -> Filesystem {
    let mut fs = Filesystem::mount(image_path(dir)).unwrap();
    fs.format(bytes).unwrap();
    fs
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn mkdir_and_ls() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.create_directory("/a").unwrap();
    fs.create_directory("/a/b").unwrap();

    let listing = fs.list_directory("/a").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "b");
    assert!(listing[0].is_dir);

    let root = fs.list_directory("/").unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].name, "a");
}

#[test]
fn write_and_read_small_file() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.write_file("/f", b"hello").unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), b"hello");

    let info = fs.node_info("/f").unwrap();
    assert!(info.contains("5 B"), "unexpected info line: {info}");
    assert!(info.contains("hard links 1"));

    let listing = fs.list_directory("/").unwrap();
    assert_eq!(listing.len(), 1);
    assert!(!listing[0].is_dir);
}

#[test]
fn write_replaces_previous_content() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.write_file("/f", &payload(3000)).unwrap();
    fs.write_file("/f", b"short now").unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), b"short now");

    // The listing still has exactly one entry for the name.
    assert_eq!(fs.list_directory("/").unwrap().len(), 1);
}

#[test]
fn payload_sizes_at_tier_boundaries_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    // 0, 1, one byte short of a block, one block, all five direct blocks,
    // first byte into the single-indirect tier.
    for (i, len) in [0, 1, 1023, 1024, 5 * 1024, 5 * 1024 + 1].iter().enumerate() {
        let path = format!("/f{i}");
        let data = payload(*len);
        fs.write_file(&path, &data).unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), data, "len {len}");
    }
}

#[test]
fn two_full_blocks_use_two_direct_references() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    let data = payload(2048);
    fs.write_file("/f", &data).unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), data);

    let info = fs.node_info("/f").unwrap();
    assert!(info.contains("2048 B"));
    // Exactly two direct blocks, no indirect tier.
    let direct = info
        .split(" - ")
        .find(|part| part.starts_with("direct blocks"))
        .unwrap();
    assert_eq!(direct.matches(',').count(), 1, "info line: {info}");
    assert!(!info.contains("indirect"));
}

#[test]
fn file_spilling_past_direct_blocks_uses_indirect_tier() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    let data = payload(6 * 1024 + 100);
    fs.write_file("/big", &data).unwrap();
    assert_eq!(fs.read_file("/big").unwrap(), data);

    let info = fs.node_info("/big").unwrap();
    assert!(info.contains("indirect level 1"), "info line: {info}");
    assert!(!info.contains("indirect level 2"));
}

#[test]
fn file_spanning_double_indirect_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    // 300 KiB needs 300 data blocks, past the 5 direct + 256 single-indirect
    // capacity, so the double-indirect tier must carry the tail.
    let data = payload(300 * 1024);
    fs.write_file("/huge", &data).unwrap();
    assert_eq!(fs.read_file("/huge").unwrap(), data);

    let info = fs.node_info("/huge").unwrap();
    assert!(info.contains("indirect level 2"), "info line: {info}");

    // Removing the file returns the space; the same write fits again.
    fs.remove_file("/huge").unwrap();
    fs.write_file("/huge2", &data).unwrap();
    assert_eq!(fs.read_file("/huge2").unwrap(), data);
}

#[test]
fn copy_file_duplicates_content() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    let data = payload(4000);
    fs.write_file("/a", &data).unwrap();
    fs.copy_file("/a", "/b").unwrap();

    assert_eq!(fs.read_file("/a").unwrap(), data);
    assert_eq!(fs.read_file("/b").unwrap(), data);

    // Independent inodes: both carry a single hard link.
    assert!(fs.node_info("/a").unwrap().contains("hard links 1"));
    assert!(fs.node_info("/b").unwrap().contains("hard links 1"));
}

#[test]
fn move_file_renames_and_unlinks_source() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    let data = payload(2500);
    fs.write_file("/a", &data).unwrap();
    fs.create_directory("/sub").unwrap();
    fs.move_file("/a", "/sub/b").unwrap();

    assert_eq!(fs.read_file("/sub/b").unwrap(), data);
    assert!(matches!(fs.read_file("/a"), Err(FsError::PathNotFound(_))));

    // Moving onto itself is a no-op.
    fs.move_file("/sub/b", "/sub/b").unwrap();
    assert_eq!(fs.read_file("/sub/b").unwrap(), data);
}

#[test]
fn hard_links_share_an_inode() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.write_file("/f", b"shared bytes").unwrap();
    fs.link_file("/f", "/g").unwrap();

    assert_eq!(fs.read_file("/g").unwrap(), b"shared bytes");

    let info_f = fs.node_info("/f").unwrap();
    let info_g = fs.node_info("/g").unwrap();
    assert!(info_f.contains("hard links 2"));
    assert!(info_g.contains("hard links 2"));

    // Same inode id on both entries.
    let inode_of = |info: &str| {
        info.split(" - ")
            .find(|part| part.starts_with("inode"))
            .unwrap()
            .to_owned()
    };
    assert_eq!(inode_of(&info_f), inode_of(&info_g));

    // Removing one name keeps the data alive through the other.
    fs.remove_file("/f").unwrap();
    assert_eq!(fs.read_file("/g").unwrap(), b"shared bytes");
    assert!(fs.node_info("/g").unwrap().contains("hard links 1"));

    fs.remove_file("/g").unwrap();
    assert!(matches!(fs.read_file("/g"), Err(FsError::PathNotFound(_))));
}

#[test]
fn link_refuses_existing_destination() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.write_file("/f", b"one").unwrap();
    fs.write_file("/g", b"two").unwrap();
    assert!(matches!(
        fs.link_file("/f", "/g"),
        Err(FsError::FileWrite(_))
    ));
}

#[test]
fn remove_directory_guards() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    assert!(matches!(fs.remove_directory(""), Err(FsError::EmptyPath)));
    assert!(matches!(
        fs.remove_directory("/"),
        Err(FsError::PathNotFound(_))
    ));

    fs.create_directory("/d").unwrap();
    fs.write_file("/d/f", b"x").unwrap();
    assert!(matches!(fs.remove_directory("/d"), Err(FsError::NotEmpty)));

    fs.remove_file("/d/f").unwrap();

    // Standing inside the directory blocks its removal.
    fs.change_directory("/d").unwrap();
    assert!(matches!(
        fs.remove_directory("/d"),
        Err(FsError::PathNotFound(_))
    ));

    fs.change_directory("/").unwrap();
    fs.remove_directory("/d").unwrap();
    assert!(fs.list_directory("/").unwrap().is_empty());
}

#[test]
fn rm_and_rmdir_refuse_the_wrong_kind() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.create_directory("/d").unwrap();
    fs.write_file("/f", b"x").unwrap();

    assert!(matches!(
        fs.remove_file("/d"),
        Err(FsError::NotADirectory(_))
    ));
    assert!(matches!(
        fs.remove_directory("/f"),
        Err(FsError::NotADirectory(_))
    ));
    assert!(matches!(
        fs.change_directory("/f"),
        Err(FsError::NotADirectory(_))
    ));
}

#[test]
fn path_resolution_handles_dot_and_dotdot() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.create_directory("/a").unwrap();
    fs.create_directory("/a/b").unwrap();
    fs.write_file("/a/b/f", b"deep").unwrap();

    assert_eq!(fs.read_file("/a/./b/../b/f").unwrap(), b"deep");

    fs.change_directory("/a/b").unwrap();
    assert_eq!(fs.current_path().unwrap(), ["a", "b"]);
    assert_eq!(fs.read_file("f").unwrap(), b"deep");
    assert_eq!(fs.read_file("../b/f").unwrap(), b"deep");

    fs.change_directory("..").unwrap();
    assert_eq!(fs.current_path().unwrap(), ["a"]);
    fs.change_directory("..").unwrap();
    assert!(fs.current_path().unwrap().is_empty());
    // ".." at the root stays at the root.
    fs.change_directory("..").unwrap();
    assert!(fs.current_path().unwrap().is_empty());

    assert!(matches!(
        fs.read_file("/a/missing"),
        Err(FsError::PathNotFound(_))
    ));
    assert!(matches!(fs.read_file(""), Err(FsError::EmptyPath)));
}

#[test]
fn relative_paths_follow_the_current_directory() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    fs.create_directory("/a").unwrap();
    fs.change_directory("a").unwrap();
    fs.write_file("f", b"relative").unwrap();
    fs.create_directory("sub").unwrap();

    assert_eq!(fs.read_file("/a/f").unwrap(), b"relative");
    let names: Vec<_> = fs
        .list_directory(".")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["f", "sub"]);
}

#[test]
fn names_longer_than_twelve_bytes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    assert!(matches!(
        fs.write_file("/thirteenchars", b"x"),
        Err(FsError::NameTooLong(_))
    ));
    assert!(matches!(
        fs.create_directory("/thirteenchars"),
        Err(FsError::NameTooLong(_))
    ));

    // Twelve bytes exactly is fine.
    fs.write_file("/exactly12ch.", b"x").unwrap();
    assert_eq!(fs.read_file("/exactly12ch.").unwrap(), b"x");
}

#[test]
fn directory_compaction_keeps_listings_contiguous() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    for i in 0..10 {
        fs.write_file(&format!("/f{i}"), b"x").unwrap();
    }

    // Remove an interior entry; the last entry moves into the hole.
    fs.remove_file("/f3").unwrap();
    let names: Vec<_> = fs
        .list_directory("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["f0", "f1", "f2", "f9", "f4", "f5", "f6", "f7", "f8"]);

    // Remove the (current) last entry; no reordering this time.
    fs.remove_file("/f8").unwrap();
    let names: Vec<_> = fs
        .list_directory("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["f0", "f1", "f2", "f9", "f4", "f5", "f6", "f7"]);

    // Every remaining name still resolves.
    for name in names {
        assert_eq!(fs.read_file(&format!("/{name}")).unwrap(), b"x");
    }
}

#[test]
fn directory_grows_past_one_block() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    // 64 entries per block; "." and ".." plus 70 files forces a second
    // directory block.
    for i in 0..70 {
        fs.write_file(&format!("/f{i}"), b"x").unwrap();
    }
    let listing = fs.list_directory("/").unwrap();
    assert_eq!(listing.len(), 70);

    for i in 0..70 {
        fs.remove_file(&format!("/f{i}")).unwrap();
    }
    assert!(fs.list_directory("/").unwrap().is_empty());
}

#[test]
fn stats_reflect_allocation_and_cwd() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    let stats = fs.stats().unwrap();
    assert!(stats.contains("Block size: 1024 B"));
    assert!(stats.contains("Working directory: /\n"));
    assert!(stats.contains("Root inode: 0"));

    fs.create_directory("/depot").unwrap();
    fs.change_directory("/depot").unwrap();
    let stats = fs.stats().unwrap();
    assert!(stats.contains("Working directory: /depot\n"));

    // One inode for the root, one for the directory.
    assert!(stats.contains("used 2"), "stats: {stats}");
}

#[test]
fn exhausting_blocks_surfaces_allocation_failure_and_recovers() {
    let dir = TempDir::new().unwrap();
    // Small image: few data blocks to burn through.
    let mut fs = formatted(&dir, 64 * 1024);

    let mut written = Vec::new();
    let chunk = payload(8 * 1024);
    let mut err = None;
    for i in 0..32 {
        let path = format!("/f{i}");
        match fs.write_file(&path, &chunk) {
            Ok(()) => written.push(path),
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }
    assert!(matches!(err, Some(FsError::CouldNotAllocateBlock)));
    assert!(!written.is_empty());

    // Reclaim space and write again.
    fs.remove_file(&written[0]).unwrap();
    fs.write_file("/again", &payload(4 * 1024)).unwrap();
    assert_eq!(fs.read_file("/again").unwrap(), payload(4 * 1024));
}

#[test]
fn state_survives_shutdown_and_remount() {
    let dir = TempDir::new().unwrap();
    let data = payload(10 * 1024);

    {
        let mut fs = formatted(&dir, MIB);
        fs.create_directory("/keep").unwrap();
        fs.write_file("/keep/data", &data).unwrap();
        fs.link_file("/keep/data", "/keep/alias").unwrap();
        fs.close().unwrap();
    }

    let mut fs = Filesystem::mount(image_path(&dir)).unwrap();
    assert!(fs.is_formatted());
    assert_eq!(fs.read_file("/keep/data").unwrap(), data);
    assert_eq!(fs.read_file("/keep/alias").unwrap(), data);
    assert!(fs.node_info("/keep/data").unwrap().contains("hard links 2"));

    // Allocation state persisted too: a new write must not clobber
    // existing data.
    fs.write_file("/new", &payload(2048)).unwrap();
    assert_eq!(fs.read_file("/keep/data").unwrap(), data);
    fs.close().unwrap();
}

#[test]
fn remount_after_drop_persists_via_best_effort_flush() {
    let dir = TempDir::new().unwrap();

    {
        let mut fs = formatted(&dir, MIB);
        fs.write_file("/f", b"dropped, not closed").unwrap();
        // No close(); Drop persists the bitmaps.
    }

    let fs = Filesystem::mount(image_path(&dir)).unwrap();
    assert!(fs.is_formatted());
    assert_eq!(fs.read_file("/f").unwrap(), b"dropped, not closed");
}

#[test]
fn duplicate_directory_names_resolve_to_the_first_entry() {
    let dir = TempDir::new().unwrap();
    let mut fs = formatted(&dir, MIB);

    // create_directory does not police duplicates; the scanner returns the
    // first match.
    fs.create_directory("/dup").unwrap();
    fs.create_directory("/dup").unwrap();

    let listing = fs.list_directory("/").unwrap();
    assert_eq!(listing.len(), 2);
    assert!(listing.iter().all(|e| e.name == "dup"));

    fs.write_file("/dup/marker", b"first").unwrap();
    assert_eq!(fs.read_file("/dup/marker").unwrap(), b"first");
}
