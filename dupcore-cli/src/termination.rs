//! SIGINT/SIGTERM handling shared by every subcommand's work loop.
//!
//! Mirrors `bin_common/termination.rs`: a clonable flag set by
//! `signal_hook`, checked cooperatively between items rather than used to abort
//! mid-item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal::*;
use signal_hook::flag::{register, register_conditional_default};

#[derive(Clone, Debug)]
pub struct Cookie {
    terminating: Arc<AtomicBool>,
}

impl Cookie {
    pub fn new() -> Result<Self, std::io::Error> {
        let terminating = Arc::new(AtomicBool::new(false));

        for flag in [SIGINT, SIGTERM] {
            register_conditional_default(flag, terminating.clone())?;
            register(flag, terminating.clone())?;
        }

        Ok(Self { terminating })
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}
