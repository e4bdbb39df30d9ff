//! End-to-end: split a source file into tiles, then render them through the worker/consumer pair.

use gwlines::{PipelineConfig, SplitOptions, TileState};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

fn write_source(path: &Path, rows: usize) {
    let mut text = String::from("id;station;x;y;kote;geometry\n");
    for i in 0..rows {
        if i == 7 {
            text.push_str("7;broken;0;0;3;\"MULTILINESTRING((500000 5538630.7027, oops))\"\n");
        } else {
            text.push_str(&format!(
                "{};S{};0;0;{};\"MULTILINESTRING((500000 5538630.7027,562366.6302 6206530.8108),(500000 0,500000 10))\";\n",
                i, i, i
            ));
        }
    }
    fs::write(path, text).unwrap();
}

fn config(tile_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        tile_dir: tile_dir.to_path_buf(),
        batch_size: 4,
        pacing: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn split_then_render() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("GroundWater.csv");
    write_source(&source, 12);

    let tiles = dir.path().join("tiles");
    let options = SplitOptions {
        records_per_tile: 5,
        ..Default::default()
    };
    assert_eq!(gwlines::split_into_tiles(&source, &tiles, &options).unwrap().len(), 3);

    let mut out: Vec<u8> = vec![];
    let report = gwtool::render(config(&tiles), None, &mut out).await.unwrap();

    // 11 good rows with two segments each; row 7 is dropped.
    assert_eq!(report.tiles.len(), 3);
    assert_eq!(report.records(), 12);
    assert_eq!(report.commands(), 22);
    assert_eq!(report.dropped(), 1);
    assert_eq!(report.tiles[1].dropped.len(), 1);
    assert!(report.tiles.iter().all(|t| t.state == TileState::Closed));
    // Tiles of 5, 5, 2 rows at 4 commands per batch: 10 -> 3 batches, 8 -> 2, 4 -> 1.
    assert_eq!(report.batches(), 6);

    let script = String::from_utf8(out).unwrap();
    let mut lines = script.lines();
    assert!(lines.next().unwrap().starts_with("// gwtool"));
    let calls: Vec<&str> = lines.collect();
    assert_eq!(calls.len(), 22);
    assert!(calls.iter().all(|c| c.starts_with("addLine([[") && c.ends_with(");")));
    // Rows arrive in source order: row 0's attribute first, row 11's last.
    assert!(calls[0].ends_with("], 0);"));
    assert!(calls[21].ends_with("], 11);"));
}

#[tokio::test]
async fn bounded_queue_delivers_everything() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("GroundWater.csv");
    write_source(&source, 40);
    let tiles = dir.path().join("tiles");
    let options = SplitOptions {
        records_per_tile: 10,
        ..Default::default()
    };
    gwlines::split_into_tiles(&source, &tiles, &options).unwrap();

    let mut out: Vec<u8> = vec![];
    let report = gwtool::render(config(&tiles), Some(1), &mut out).await.unwrap();
    let script = String::from_utf8(out).unwrap();
    assert_eq!(report.commands(), 78);
    assert_eq!(script.lines().filter(|l| l.starts_with("addLine(")).count(), 78);
}

/// Output that refuses every write, like a closed pipe.
struct ClosedPipe;

impl io::Write for ClosedPipe {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn write_failure_waits_for_worker() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("GroundWater.csv");
    write_source(&source, 9);
    let tiles = dir.path().join("tiles");
    let options = SplitOptions {
        records_per_tile: 3,
        ..Default::default()
    };
    gwlines::split_into_tiles(&source, &tiles, &options).unwrap();

    let config = PipelineConfig {
        pacing: Duration::from_millis(40),
        ..config(&tiles)
    };
    let started = Instant::now();
    let result = gwtool::render(config, None, &mut ClosedPipe).await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("closed"), "{}", err);
    // The header write fails at once; returning only after both pauses means the worker
    // was awaited rather than left running.
    assert!(started.elapsed() >= Duration::from_millis(80), "{:?}", started.elapsed());
}

#[tokio::test]
async fn empty_directory_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut out: Vec<u8> = vec![];
    let report = gwtool::render(config(dir.path()), None, &mut out).await.unwrap();
    assert!(report.tiles.is_empty());
    let script = String::from_utf8(out).unwrap();
    assert_eq!(script.lines().count(), 1);
}

#[test]
fn inspect_one_tile() {
    let dir = tempfile::tempdir().unwrap();
    let tile = dir.path().join("tile_00000.csv");
    write_source(&tile, 9);
    let report = gwtool::inspect(&tile, config(dir.path())).unwrap();
    assert_eq!(report.records, 9);
    assert_eq!(report.commands, 16);
    assert_eq!(report.dropped.len(), 1);
    let verbose = format!("{:+}", report);
    assert!(verbose.contains("line 9: invalid geometry"));
    assert!(!format!("{}", report).contains("line 9"));
}
