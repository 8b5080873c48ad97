//! Cross-host advisory lock shared by backup and restore runs.
//!
//! The lock is a marker file holding `<hostname>-<pid>`, written on the
//! remote host first and then on this host, each made immutable with
//! `chattr +i` while held. A crashed holder leaves its markers behind; they
//! have to be removed by hand (`chattr -i <file>; rm <file>`).

pub mod guard;
pub mod marker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::model::{LockTiming, Settings};
use crate::error::{LockError, Result};
use crate::lock::marker::{
    LocalCreate, LocalMarker, RemoteCreate, RemoteMarker, RemoteRemove, RemoteState,
};
use crate::util::command::Runner;

pub use guard::LockGuard;

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Shared flag flipped by the signal handler to stop a waiting acquire.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Proof of a held lock. Records which markers this process wrote, so
/// release never deletes one it found already in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub hostname: String,
    pub identity: String,
    pub remote_created: bool,
    pub local_created: bool,
}

/// Lock state visible to the signal handler, updated as soon as a marker is
/// written.
pub type LockTracker = Arc<Mutex<Option<LockHandle>>>;

pub struct LockCoordinator {
    runner: Runner,
    lock_file: PathBuf,
    identity: String,
    timing: LockTiming,
    tracker: LockTracker,
}

impl LockCoordinator {
    pub fn new(runner: Runner, settings: &Settings, identity: impl Into<String>) -> Self {
        Self {
            runner,
            lock_file: settings.lock_file.clone(),
            identity: identity.into().to_ascii_lowercase(),
            timing: settings.lock.clone(),
            tracker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tracker(&self) -> LockTracker {
        self.tracker.clone()
    }

    /// Blocks until both markers are held by this process. Only `cancel`
    /// and `deadline` bound the wait.
    pub fn acquire(
        &self,
        hostname: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<LockHandle> {
        let presleep = self.random_between(Duration::ZERO, self.timing.presleep_max);
        if !presleep.is_zero() {
            info!("Waiting for {:.1}s before starting...", presleep.as_secs_f64());
            self.pause(presleep, hostname, cancel, deadline)?;
        }
        info!("Acquiring locks");

        let remote = RemoteMarker {
            hostname,
            path: &self.lock_file,
        };
        let local = LocalMarker::new(&self.lock_file);

        loop {
            self.wait_until_free(&remote, &local, cancel, deadline)?;

            match remote.create(&self.runner, &self.identity)? {
                RemoteCreate::Created => debug!("remotely locked"),
                RemoteCreate::Refused(stderr) => {
                    warn!("Wasn't able to get the remote lock! {}", stderr);
                    self.pause_poll(hostname, cancel, deadline)?;
                    continue;
                }
                RemoteCreate::Unreachable(stderr) => {
                    warn!("(SSH) Error in putting lock on remote side, trying again. {}", stderr);
                    self.pause_poll(hostname, cancel, deadline)?;
                    continue;
                }
            }
            let mut handle = LockHandle {
                hostname: hostname.to_string(),
                identity: self.identity.clone(),
                remote_created: true,
                local_created: false,
            };
            self.track(Some(handle.clone()));

            let local_result = local.create(&self.runner, &self.identity);
            match local_result {
                Ok(LocalCreate::Created) => handle.local_created = true,
                Ok(LocalCreate::AlreadyOurs) => {}
                Ok(LocalCreate::HeldBy(holder)) => {
                    warn!(
                        "Local lock is held by {} even though the precheck said it was free. Unlocking remote and trying again...",
                        holder
                    );
                    self.release(handle)?;
                    continue;
                }
                Err(err) => {
                    warn!("Local lock could not be written ({}). Unlocking remote and trying again...", err);
                    self.release(handle)?;
                    continue;
                }
            }
            self.track(Some(handle.clone()));
            info!("Locks acquired");
            return Ok(handle);
        }
    }

    /// Removes the markers `handle` says this process created. The remote
    /// removal retries until the marker is gone.
    pub fn release(&self, handle: LockHandle) -> Result<()> {
        self.track(None);
        if handle.remote_created || handle.local_created {
            info!("Releasing locks");
        }

        if handle.remote_created {
            let remote = RemoteMarker {
                hostname: &handle.hostname,
                path: &self.lock_file,
            };
            loop {
                match remote.remove(&self.runner)? {
                    RemoteRemove::Removed => break,
                    RemoteRemove::Missing => {
                        debug!("(SSH) remote lockfile doesn't exist anymore");
                        break;
                    }
                    RemoteRemove::Failed(stderr) => {
                        warn!("(SSH) Error while deleting the remote lock, trying again {}", stderr);
                        thread::sleep(self.timing.release_retry);
                    }
                }
            }
        } else {
            debug!("not removing remote lockfile, it was not created by this process");
        }

        if handle.local_created {
            let local = LocalMarker::new(&self.lock_file);
            if !local.remove(&self.runner)? {
                debug!("local lockfile {} was already gone", self.lock_file.display());
            }
        } else {
            debug!("not removing local lockfile, it was not created by this process");
        }

        if handle.remote_created || handle.local_created {
            info!("Locks released");
        }
        Ok(())
    }

    /// Releases whatever the tracker currently records. Used on interrupt.
    pub fn release_tracked(&self) -> Result<()> {
        let handle = match self.tracker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => self.release(handle),
            None => Ok(()),
        }
    }

    fn wait_until_free(
        &self,
        remote: &RemoteMarker<'_>,
        local: &LocalMarker,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            self.check_abort(remote.hostname, cancel, deadline)?;
            let remote_free = match remote.check(&self.runner)? {
                RemoteState::Free => {
                    debug!("remote lockfile does not exist, can proceed");
                    true
                }
                RemoteState::HeldBy(holder) => {
                    info!("Remote lock is held by {}, have to wait...", holder);
                    false
                }
                RemoteState::Unreachable(stderr) => {
                    warn!(
                        "(SSH) Error while checking lock availability (maybe host is down or network issue) {}",
                        stderr
                    );
                    false
                }
            };
            if remote_free {
                match local.holder()? {
                    None => return Ok(()),
                    Some(holder) => info!("Local lock is held by {}, have to wait...", holder),
                }
            }
            self.pause_poll(remote.hostname, cancel, deadline)?;
        }
    }

    fn pause_poll(
        &self,
        hostname: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let wait = self.random_between(self.timing.poll_min, self.timing.poll_max);
        debug!("lock is held, sleeping {:.1}s", wait.as_secs_f64());
        self.pause(wait, hostname, cancel, deadline)
    }

    fn pause(
        &self,
        total: Duration,
        hostname: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let until = Instant::now() + total;
        loop {
            self.check_abort(hostname, cancel, deadline)?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }

    fn check_abort(
        &self,
        hostname: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled.into());
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(LockError::TimedOut(hostname.to_string()).into());
            }
        }
        Ok(())
    }

    fn random_between(&self, min: Duration, max: Duration) -> Duration {
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        if max_ms <= min_ms {
            return min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }

    fn track(&self, handle: Option<LockHandle>) {
        if let Ok(mut slot) = self.tracker.lock() {
            *slot = handle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PzmError;
    use crate::testing::{output, ScriptedRunner};
    use crate::types::RunMode;
    use crate::util::command::{render_command, CommandOutput, CommandRunner};
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    /// Simulates the remote host's marker file. With `shared_fs` the remote
    /// host is this host, so its marker is the local file.
    struct FakeRemote {
        local_path: PathBuf,
        shared_fs: bool,
        remote: Mutex<Option<String>>,
        on_remote_create: Option<Box<dyn Fn() + Send + Sync>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn new(local_path: PathBuf, shared_fs: bool) -> Self {
            Self {
                local_path,
                shared_fs,
                remote: Mutex::new(None),
                on_remote_create: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn remote_content(&self) -> Option<String> {
            if self.shared_fs {
                fs::read_to_string(&self.local_path).ok()
            } else {
                self.remote.lock().unwrap().clone()
            }
        }

        fn set_remote(&self, value: Option<String>) {
            if self.shared_fs {
                match value {
                    Some(v) => fs::write(&self.local_path, v).unwrap(),
                    None => {
                        let _ = fs::remove_file(&self.local_path);
                    }
                }
            } else {
                *self.remote.lock().unwrap() = value;
            }
        }
    }

    impl CommandRunner for FakeRemote {
        fn output(&self, cmd: &mut Command) -> std::io::Result<CommandOutput> {
            let line = render_command(cmd);
            self.calls.lock().unwrap().push(line.clone());
            if !line.starts_with("ssh") {
                return Ok(CommandOutput::default());
            }
            if line.contains(" cat ") {
                return Ok(match self.remote_content() {
                    Some(content) => output(0, &content, ""),
                    None => output(1, "", "No such file or directory"),
                });
            }
            if line.contains("echo -n") {
                if self.remote_content().is_some() {
                    return Ok(output(1, "", "Operation not permitted"));
                }
                let identity = line
                    .split("echo -n ")
                    .nth(1)
                    .and_then(|rest| rest.split(' ').next())
                    .unwrap_or_default()
                    .to_string();
                self.set_remote(Some(identity));
                if let Some(hook) = &self.on_remote_create {
                    hook();
                }
                return Ok(CommandOutput::default());
            }
            if line.contains("chattr -i") && line.contains("rm ") {
                if self.remote_content().is_none() {
                    return Ok(output(1, "", "No such file or directory"));
                }
                self.set_remote(None);
                return Ok(CommandOutput::default());
            }
            Ok(CommandOutput::default())
        }
    }

    fn fast_settings(dir: &TempDir) -> Settings {
        Settings {
            lock_file: dir.path().join("manager_sync.lock"),
            lock: LockTiming {
                presleep_max: Duration::ZERO,
                poll_min: Duration::from_millis(1),
                poll_max: Duration::from_millis(2),
                release_retry: Duration::ZERO,
            },
            ..Settings::default()
        }
    }

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(100))
    }

    #[test]
    fn acquire_release_round_trip_leaves_no_markers() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let fake = Arc::new(FakeRemote::new(settings.lock_file.clone(), false));
        let coordinator = LockCoordinator::new(
            Runner::new(fake.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );

        let handle = coordinator
            .acquire("backup01", &CancelToken::new(), None)
            .expect("acquire");
        assert!(handle.remote_created);
        assert!(handle.local_created);
        assert_eq!(fake.remote_content().as_deref(), Some("pve01-100"));
        assert_eq!(
            fs::read_to_string(&settings.lock_file).unwrap(),
            "pve01-100"
        );
        assert_eq!(*coordinator.tracker().lock().unwrap(), Some(handle.clone()));

        coordinator.release(handle).expect("release");
        assert!(fake.remote_content().is_none());
        assert!(!settings.lock_file.exists());
        assert!(coordinator.tracker().lock().unwrap().is_none());
    }

    #[test]
    fn local_backup_reuses_marker_written_by_remote_step() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let fake = Arc::new(FakeRemote::new(settings.lock_file.clone(), true));
        let coordinator = LockCoordinator::new(
            Runner::new(fake.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );

        let handle = coordinator
            .acquire("localhost", &CancelToken::new(), None)
            .expect("acquire");
        assert!(handle.remote_created);
        assert!(!handle.local_created);

        coordinator.release(handle).expect("release");
        assert!(!settings.lock_file.exists());
    }

    #[test]
    fn waits_while_remote_is_held_by_someone_else() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let fake = Arc::new(FakeRemote::new(settings.lock_file.clone(), false));
        fake.set_remote(Some("pve02-77".to_string()));
        let coordinator = LockCoordinator::new(
            Runner::new(fake.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );

        let err = coordinator
            .acquire("backup01", &CancelToken::new(), soon())
            .unwrap_err();
        assert!(matches!(err, PzmError::Lock(LockError::TimedOut(_))));
        assert_eq!(fake.remote_content().as_deref(), Some("pve02-77"));
        assert!(!settings.lock_file.exists());
        assert!(fake.calls.lock().unwrap().iter().all(|c| !c.contains("echo -n")));
    }

    #[test]
    fn unreachable_remote_keeps_waiting() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on_sequence(
            "cat",
            vec![output(255, "", "ssh: connect to host backup01 port 22: No route to host")],
        );
        let coordinator = LockCoordinator::new(
            Runner::new(scripted.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );

        let err = coordinator
            .acquire("backup01", &CancelToken::new(), soon())
            .unwrap_err();
        assert!(matches!(err, PzmError::Lock(LockError::TimedOut(_))));
        assert!(scripted.calls_matching("cat").len() > 1);
        assert!(scripted.calls_matching("echo -n").is_empty());
    }

    #[test]
    fn cancelled_token_stops_waiting() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        fs::write(&settings.lock_file, "pve03-1").unwrap();
        let fake = Arc::new(FakeRemote::new(settings.lock_file.clone(), false));
        let coordinator = LockCoordinator::new(
            Runner::new(fake, RunMode::default()),
            &settings,
            "pve01-100",
        );
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = coordinator.acquire("backup01", &cancel, None).unwrap_err();
        assert!(matches!(err, PzmError::Lock(LockError::Cancelled)));
        assert_eq!(fs::read_to_string(&settings.lock_file).unwrap(), "pve03-1");
    }

    #[test]
    fn local_race_releases_remote_marker_and_retries() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let local_path = settings.lock_file.clone();
        let mut fake = FakeRemote::new(local_path.clone(), false);
        fake.on_remote_create = Some(Box::new(move || {
            let _ = fs::write(&local_path, "pve09-5");
        }));
        let fake = Arc::new(fake);
        let coordinator = LockCoordinator::new(
            Runner::new(fake.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );

        let err = coordinator
            .acquire("backup01", &CancelToken::new(), soon())
            .unwrap_err();
        assert!(matches!(err, PzmError::Lock(LockError::TimedOut(_))));
        assert!(fake.remote_content().is_none());
        assert_eq!(fs::read_to_string(&settings.lock_file).unwrap(), "pve09-5");
        assert!(coordinator.tracker().lock().unwrap().is_none());
    }

    #[test]
    fn release_retries_transient_remote_failures() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on_sequence(
            "chattr -i",
            vec![
                output(255, "", "Connection reset"),
                output(255, "", "Connection reset"),
                output(0, "", ""),
            ],
        );
        let coordinator = LockCoordinator::new(
            Runner::new(scripted.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );
        let handle = LockHandle {
            hostname: "backup01".to_string(),
            identity: "pve01-100".to_string(),
            remote_created: true,
            local_created: false,
        };

        coordinator.release(handle).expect("release");
        assert_eq!(scripted.calls_matching("rm ").len(), 3);
    }

    #[test]
    fn release_accepts_remote_marker_already_gone() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        fs::write(&settings.lock_file, "pve01-100").unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.on_sequence(
            "root@backup01 chattr -i",
            vec![output(1, "", "No such file or directory")],
        );
        let coordinator = LockCoordinator::new(
            Runner::new(scripted.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );
        let handle = LockHandle {
            hostname: "backup01".to_string(),
            identity: "pve01-100".to_string(),
            remote_created: true,
            local_created: true,
        };

        coordinator.release(handle).expect("release");
        assert_eq!(scripted.calls_matching("root@backup01 chattr -i").len(), 1);
        assert!(!settings.lock_file.exists());
    }

    #[test]
    fn release_keeps_markers_this_process_did_not_create() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        fs::write(&settings.lock_file, "pve01-100").unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        let coordinator = LockCoordinator::new(
            Runner::new(scripted.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );
        let handle = LockHandle {
            hostname: "backup01".to_string(),
            identity: "pve01-100".to_string(),
            remote_created: false,
            local_created: false,
        };

        coordinator.release(handle).expect("release");
        assert!(settings.lock_file.exists());
        assert!(scripted.calls().is_empty());
    }

    #[test]
    fn release_tracked_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let settings = fast_settings(&dir);
        let fake = Arc::new(FakeRemote::new(settings.lock_file.clone(), false));
        let coordinator = LockCoordinator::new(
            Runner::new(fake.clone(), RunMode::default()),
            &settings,
            "pve01-100",
        );
        coordinator
            .acquire("backup01", &CancelToken::new(), None)
            .expect("acquire");

        coordinator.release_tracked().expect("release");
        coordinator.release_tracked().expect("second release");
        assert!(fake.remote_content().is_none());
        assert!(!settings.lock_file.exists());
    }
}
