//! Console output: detection lines and a live level meter.
//!
//! The meter renders the output frame level as a colored bar, one cell per
//! 5 dB above the -90 dBFS floor: green up to 6 cells, yellow to 12, red
//! beyond. Detections print as one JSON line per classified patch.

use std::io::Write;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use earshot_core::{DetectionEvent, LevelEvent};
use tokio::sync::broadcast::{error::TryRecvError, Receiver};

/// Meter floor in dBFS (16-bit full scale).
const METER_FLOOR_DB: f32 = -90.3;
const METER_CELLS: i32 = 20;
const DB_PER_CELL: f32 = 5.0;

/// Render one meter line for `db`.
pub fn level_bar(db: f32) -> String {
    let lev = (((db - METER_FLOOR_DB) / DB_PER_CELL) as i32).clamp(0, METER_CELLS);
    let mut bar = String::new();
    bar.push_str("\x1b[42m");
    for _ in 0..lev.min(6) {
        bar.push(' ');
    }
    bar.push_str("\x1b[43m");
    for _ in 6..lev.min(12) {
        bar.push(' ');
    }
    bar.push_str("\x1b[41m");
    for _ in 12..lev {
        bar.push(' ');
    }
    bar.push_str("\x1b[0m");
    for _ in lev..METER_CELLS {
        bar.push(' ');
    }
    bar
}

/// Print the level meter in place until the channel closes.
pub fn spawn_meter(mut rx: Receiver<LevelEvent>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.try_recv() {
            Ok(event) => {
                let gate = if event.gated { " [gated]" } else { "        " };
                print!("\r{} {:6.1} dB{}", level_bar(event.level_db), event.level_db, gate);
                let _ = std::io::stdout().flush();
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => break,
        }
    })
}

/// Print one JSON line per detection until the channel closes.
pub fn spawn_detections(mut rx: Receiver<DetectionEvent>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.try_recv() {
            Ok(event) => {
                println!("\r{{\"class\":\"{}\",\"score\":{:.2}}}", event.label, event.score);
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => break,
        }
    })
}
