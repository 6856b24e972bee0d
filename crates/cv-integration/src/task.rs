//! Background install tasks
//!
//! An install runs on its own thread and reports through a channel: any
//! number of [`InstallEvent::Progress`] events followed by exactly one
//! [`InstallEvent::Finished`].

use crossbeam::channel::{unbounded, Receiver};
use cv_core::cancel::CancellationToken;
use cv_core::error::InstallError;
use cv_core::title::InstalledTitle;
use cv_vfs::{InstallOptions, InstallProgress, Installer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Message from a running install
#[derive(Debug)]
pub enum InstallEvent {
    Progress(InstallProgress),
    Finished(Result<InstalledTitle, InstallError>),
}

/// Handle to an install running in the background
pub struct InstallTask {
    source: PathBuf,
    events: Receiver<InstallEvent>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl InstallTask {
    pub(crate) fn spawn(installer: Arc<Installer>, source: PathBuf, options: InstallOptions) -> Self {
        let (sender, events) = unbounded();
        let cancel = CancellationToken::new();

        let thread_name = format!(
            "install-{}",
            source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let worker_cancel = cancel.clone();
        let worker_source = source.clone();
        let worker_sender = sender.clone();

        let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
            let progress = |p: InstallProgress| {
                // The receiver may have been dropped; the install still completes
                let _ = worker_sender.send(InstallEvent::Progress(p));
            };
            let result = installer.install_file(&worker_source, &options, &progress, &worker_cancel);
            let _ = worker_sender.send(InstallEvent::Finished(result));
        });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to start install thread: {}", e);
                let _ = sender.send(InstallEvent::Finished(Err(InstallError::io(&source, e))));
                None
            }
        };

        Self {
            source,
            events,
            cancel,
            thread,
        }
    }

    /// Package being installed
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Event stream; ends after `Finished`
    pub fn events(&self) -> &Receiver<InstallEvent> {
        &self.events
    }

    /// Request cancellation; takes effect at the next entry boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the install finishes
    pub fn wait(self) -> Result<InstalledTitle, InstallError> {
        self.wait_with(|_| {})
    }

    /// Block until the install finishes, passing progress to `on_progress`
    pub fn wait_with(
        mut self,
        mut on_progress: impl FnMut(InstallProgress),
    ) -> Result<InstalledTitle, InstallError> {
        let mut result = None;
        for event in self.events.iter() {
            match event {
                InstallEvent::Progress(p) => on_progress(p),
                InstallEvent::Finished(r) => {
                    result = Some(r);
                    break;
                }
            }
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Install thread for {} panicked", self.source.display());
            }
        }

        result.unwrap_or_else(|| {
            Err(InstallError::io(
                &self.source,
                std::io::Error::other("install thread exited without a result"),
            ))
        })
    }
}
