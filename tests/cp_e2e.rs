mod common;

use anyhow::Result;
use common::{accept_all, end, error_frame, header, pattern, payload, pull_server, push_server, PushLog};
use hypeman::error::CopyError;
use hypeman::logger::{MemoryLogger, NoopLogger};
use hypeman::resolve::{resolve_push_destination, EndpointStat};
use hypeman::tar_stream::{pull_to_writer, push_from_reader};
use hypeman::transfer::{pull_path, push_path, TransferOptions};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tar::{Archive, Builder, EntryType, Header};

fn existing_dir() -> EndpointStat {
    EndpointStat {
        exists: true,
        is_dir: true,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_large_file_into_existing_directory() -> Result<()> {
    let src = tempfile::tempdir()?;
    let file = src.path().join("big.bin");
    let content = pattern(10 * 1024 * 1024);
    std::fs::write(&file, &content)?;

    let file_arg = file.to_string_lossy().into_owned();
    let target = resolve_push_destination(&file_arg, false, "/data", existing_dir())?;
    assert_eq!(target, "/data/big.bin");

    let log = PushLog::default();
    let dialer = push_server(log.clone(), accept_all);
    let stats = push_path(
        &dialer,
        &file,
        &target,
        false,
        true,
        TransferOptions::default(),
        &NoopLogger,
    )
    .await?;

    assert_eq!(stats.entries, 1);
    assert_eq!(stats.bytes, content.len() as u64);
    let pushed = log.lock().unwrap().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].request["direction"], "to");
    assert_eq!(pushed[0].request["guest_path"], "/data/big.bin");
    assert_eq!(pushed[0].request["is_dir"], false);
    assert_eq!(pushed[0].request["uid"], 0);
    assert!(pushed[0].data == content, "payload differs from source");
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_tree_contents_into_existing_directory() -> Result<()> {
    let src = tempfile::tempdir()?;
    let root = src.path().join("site");
    std::fs::create_dir_all(root.join("css"))?;
    std::fs::write(root.join("index.html"), b"<html/>")?;
    std::fs::write(root.join("css/main.css"), b"body{}")?;
    std::os::unix::fs::symlink("index.html", root.join("home.html"))?;

    let log = PushLog::default();
    let dialer = push_server(log.clone(), accept_all);
    let logger = MemoryLogger::default();
    let stats = push_path(
        &dialer,
        &root,
        "/srv/www",
        true,
        true,
        TransferOptions::default(),
        &logger,
    )
    .await?;

    let paths: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.request["guest_path"].as_str().unwrap_or_default().to_string())
        .collect();
    // The existing root is not recreated; the symlink is skipped
    assert_eq!(
        paths,
        vec!["/srv/www/css", "/srv/www/css/main.css", "/srv/www/index.html"]
    );
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.bytes, 13);
    assert_eq!(dialer.dials(), 3);
    assert!(logger
        .events()
        .iter()
        .any(|e| e.starts_with("skip ") && e.ends_with("symlink")));
    Ok(())
}

#[tokio::test]
async fn push_rejection_surfaces_server_error() -> Result<()> {
    let src = tempfile::tempdir()?;
    let file = src.path().join("a.txt");
    std::fs::write(&file, b"abc")?;

    let log = PushLog::default();
    let dialer = push_server(log, |_req: &Value, _len| {
        json!({"type": "result", "success": false, "error": "no space left on device"})
    });
    let err = push_path(
        &dialer,
        &file,
        "/full/a.txt",
        false,
        false,
        TransferOptions::default(),
        &NoopLogger,
    )
    .await
    .unwrap_err();

    match err.downcast_ref::<CopyError>() {
        Some(CopyError::Rejected(msg)) => assert_eq!(msg, "no space left on device"),
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

fn log_tree_frames(size_claim: u64) -> Vec<tokio_tungstenite::tungstenite::Message> {
    vec![
        header(json!({"path": "app", "mode": 0o40755, "is_dir": true, "uid": 1000, "gid": 1001})),
        end(false),
        header(json!({
            "path": "app/log.txt", "mode": 0o100640, "size": size_claim,
            "mtime": 1_700_000_000, "uid": 1000, "gid": 1001
        })),
        payload(b"hello"),
        end(false),
        header(json!({
            "path": "app/current", "mode": 0o120777, "is_symlink": true,
            "link_target": "log.txt", "uid": 1000, "gid": 1001
        })),
        end(false),
        end(true),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_to_tar_preserves_ownership_in_archive_mode() -> Result<()> {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let dialer = pull_server(requests.clone(), log_tree_frames(5));
    let opts = TransferOptions {
        archive: true,
        follow_links: false,
    };
    let (stats, bytes) = pull_to_writer(&dialer, "/var/log", opts, Vec::new(), &NoopLogger).await?;

    assert_eq!(stats.entries, 3);
    assert_eq!(stats.bytes, 5);
    let request = requests.lock().unwrap()[0].clone();
    assert_eq!(request["direction"], "from");
    assert_eq!(request["guest_path"], "/var/log");
    assert_eq!(request["follow_links"], false);

    let mut archive = Archive::new(bytes.as_slice());
    let mut seen = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let h = entry.header().clone();
        assert_eq!(h.uid()?, 1000, "uid of {}", name);
        assert_eq!(h.gid()?, 1001, "gid of {}", name);
        let mut body = String::new();
        std::io::Read::read_to_string(&mut entry, &mut body)?;
        seen.push((name, h.entry_type(), h.mode()?, body));
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, "app/");
    assert_eq!(seen[0].1, EntryType::Directory);
    assert_eq!(seen[0].2, 0o755);
    assert_eq!(seen[1].0, "app/log.txt");
    assert_eq!(seen[1].2, 0o640);
    assert_eq!(seen[1].3, "hello");
    assert_eq!(seen[2].0, "app/current");
    assert_eq!(seen[2].1, EntryType::Symlink);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_to_tar_drops_ownership_without_archive_mode() -> Result<()> {
    let dialer = pull_server(Arc::default(), log_tree_frames(5));
    let (_, bytes) = pull_to_writer(
        &dialer,
        "/var/log",
        TransferOptions::default(),
        Vec::new(),
        &NoopLogger,
    )
    .await?;

    let mut archive = Archive::new(bytes.as_slice());
    for entry in archive.entries()? {
        let entry = entry?;
        assert_eq!(entry.header().uid()?, 0);
        assert_eq!(entry.header().gid()?, 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_detects_short_payload() {
    let dialer = pull_server(Arc::default(), log_tree_frames(9));
    let out = tempfile::tempdir().unwrap();
    let err = pull_path(
        &dialer,
        "/var/log",
        out.path().join("log"),
        true,
        TransferOptions::default(),
        &NoopLogger,
    )
    .await
    .unwrap_err();

    match err.downcast_ref::<CopyError>() {
        Some(CopyError::SizeMismatch {
            path,
            expected,
            actual,
        }) => {
            assert_eq!(path, "app/log.txt");
            assert_eq!(*expected, 9);
            assert_eq!(*actual, 5);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_detects_oversized_payload() {
    let dialer = pull_server(Arc::default(), log_tree_frames(2));
    let err = pull_to_writer(
        &dialer,
        "/var/log",
        TransferOptions::default(),
        Vec::new(),
        &NoopLogger,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CopyError>(),
        Some(CopyError::SizeMismatch { actual: 5, .. })
    ));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_writes_tree_to_local_directory() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dialer = pull_server(Arc::default(), log_tree_frames(5));
    let out = tempfile::tempdir()?;
    let dst = out.path().join("logs");
    let logger = MemoryLogger::default();
    let stats = pull_path(
        &dialer,
        "/var/log",
        dst.clone(),
        true,
        TransferOptions::default(),
        &logger,
    )
    .await?;

    assert_eq!(stats.entries, 3);
    assert_eq!(std::fs::read(dst.join("app/log.txt"))?, b"hello");
    let mode = std::fs::metadata(dst.join("app/log.txt"))?.permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
    assert_eq!(
        std::fs::read_link(dst.join("app/current"))?,
        std::path::PathBuf::from("log.txt")
    );
    let events = logger.events();
    assert!(events.contains(&"copy app/log.txt 5".to_string()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_single_file_lands_on_destination_path() -> Result<()> {
    let frames = vec![
        header(json!({"path": "motd", "mode": 0o100644, "size": 3})),
        payload(b"hi\n"),
        end(false),
        end(true),
    ];
    let dialer = pull_server(Arc::default(), frames);
    let out = tempfile::tempdir()?;
    let dst = out.path().join("welcome.txt");
    pull_path(
        &dialer,
        "/etc/motd",
        dst.clone(),
        false,
        TransferOptions::default(),
        &NoopLogger,
    )
    .await?;
    assert_eq!(std::fs::read(&dst)?, b"hi\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_reports_remote_error() {
    let frames = vec![error_frame("permission denied", "/root/secret")];
    let dialer = pull_server(Arc::default(), frames);
    let err = pull_to_writer(
        &dialer,
        "/root",
        TransferOptions::default(),
        Vec::new(),
        &NoopLogger,
    )
    .await
    .unwrap_err();
    match err.downcast_ref::<CopyError>() {
        Some(CopyError::Remote { message, path }) => {
            assert_eq!(message, "permission denied");
            assert_eq!(path, "/root/secret");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_without_final_marker_is_incomplete() {
    let frames = vec![
        header(json!({"path": "a", "mode": 0o100644, "size": 1})),
        payload(b"x"),
        end(false),
    ];
    let dialer = pull_server(Arc::default(), frames);
    let err = pull_to_writer(
        &dialer,
        "/a",
        TransferOptions::default(),
        Vec::new(),
        &NoopLogger,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CopyError>(),
        Some(CopyError::Incomplete)
    ));
}

fn sample_archive() -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    let mut dir = Header::new_gnu();
    dir.set_entry_type(EntryType::Directory);
    dir.set_mode(0o750);
    dir.set_uid(33);
    dir.set_gid(33);
    dir.set_size(0);
    builder.append_data(&mut dir, "site/", std::io::empty())?;

    let body = b"<h1>ok</h1>";
    let mut file = Header::new_gnu();
    file.set_entry_type(EntryType::Regular);
    file.set_mode(0o644);
    file.set_uid(33);
    file.set_gid(33);
    file.set_size(body.len() as u64);
    builder.append_data(&mut file, "site/index.html", &body[..])?;

    let mut link = Header::new_gnu();
    link.set_entry_type(EntryType::Symlink);
    link.set_size(0);
    builder.append_link(&mut link, "site/latest", "index.html")?;

    Ok(builder.into_inner()?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_from_tar_creates_entries_and_skips_symlinks() -> Result<()> {
    let log = PushLog::default();
    let dialer = push_server(log.clone(), accept_all);
    let logger = MemoryLogger::default();
    let input = std::io::Cursor::new(sample_archive()?);

    let stats = push_from_reader(&dialer, input, "/srv", true, &logger).await?;

    assert_eq!(stats.entries, 2);
    assert_eq!(stats.bytes, 11);
    let pushed = log.lock().unwrap().clone();
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0].request["guest_path"], "/srv/site");
    assert_eq!(pushed[0].request["is_dir"], true);
    assert_eq!(pushed[0].request["mode"], 0o750);
    assert_eq!(pushed[0].request["uid"], 33);
    assert_eq!(pushed[1].request["guest_path"], "/srv/site/index.html");
    assert_eq!(pushed[1].data, b"<h1>ok</h1>");
    assert!(logger
        .events()
        .iter()
        .any(|e| e.starts_with("skip site/latest")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_from_tar_without_archive_mode_zeroes_ownership() -> Result<()> {
    let log = PushLog::default();
    let dialer = push_server(log.clone(), accept_all);
    let input = std::io::Cursor::new(sample_archive()?);

    push_from_reader(&dialer, input, "/srv", false, &NoopLogger).await?;

    for p in log.lock().unwrap().iter() {
        assert_eq!(p.request["uid"], 0);
        assert_eq!(p.request["gid"], 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_from_truncated_tar_fails() {
    let mut bytes = sample_archive().unwrap();
    // Cut into the file payload
    bytes.truncate(512 * 2 + 4);
    let log = PushLog::default();
    let dialer = push_server(log, accept_all);
    let result = push_from_reader(
        &dialer,
        std::io::Cursor::new(bytes),
        "/srv",
        false,
        &NoopLogger,
    )
    .await;
    assert!(result.is_err());
}
