//! Live capture handler

use anyhow::Result;
use blueprobe::{CaptureKind, Session};
use std::thread;
use std::time::Duration;

const STATUS_POLL: Duration = Duration::from_millis(500);

/// Stream `kind` traffic to the viewer until the viewer is closed or the
/// controller goes away.
pub fn run(session: &Session, kind: CaptureKind) -> Result<()> {
    session.start_monitor(kind)?;
    println!("{} monitor running; close the viewer to stop", kind);

    while session.monitors().status(kind) && session.channel().is_connected() {
        thread::sleep(STATUS_POLL);
    }

    session.monitors().kill(kind);
    println!("{} monitor stopped", kind);
    Ok(())
}
