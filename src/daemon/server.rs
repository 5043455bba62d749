//! Daemon server: wires the broker, managers and dispatchers together

use crate::daemon::app::AppManager;
use crate::daemon::config::DaemonConfig;
use crate::daemon::directory::{spawn_watcher, PeerDirectory, StaticDirectory};
use crate::daemon::memspace::{MemorySpacePool, MemorySpaceProvider};
use crate::daemon::serializer::{Broker, BrokerPorts, Event};
use crate::daemon::speer::SpeerManager;
use crate::daemon::task::TaskTracker;
use crate::daemon::tx::{ToApp, ToSpeer, ToWpeer, TxDispatcher};
use crate::daemon::wpeer::WpeerManager;
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use nix::sys::signal;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the foreground loop checks the signal flag
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Daemon ready to start
pub struct DaemonServer {
    config: DaemonConfig,
    directory: Arc<dyn PeerDirectory>,
    spaces: Option<Box<dyn MemorySpaceProvider>>,
}

impl DaemonServer {
    /// Create a daemon using the static peers of `config` as directory
    pub fn new(config: DaemonConfig) -> Self {
        let directory = Arc::new(StaticDirectory::new(config.peers.clone()));
        Self {
            config,
            directory,
            spaces: None,
        }
    }

    /// Use another fabric directory
    pub fn with_directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Use another memory space provider instead of the configured pool
    pub fn with_memory_spaces(mut self, spaces: Box<dyn MemorySpaceProvider>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Bind both listeners and start every thread
    pub fn start(self) -> Result<RunningDaemon> {
        let config = self.config;
        let local = config.local_node();
        let tracker = TaskTracker::new();

        let peer_listener = TcpListener::bind(config.peer_addr)
            .with_context(|| format!("binding peer listener on {}", config.peer_addr))?;
        let peer_addr = peer_listener.local_addr()?;
        let app_listener = bind_socket(&config.app_socket)?;

        let (events, events_rx) = unbounded();
        let (app_tx, app_rx) = unbounded();
        let (speer_tx, speer_rx) = unbounded();
        let (wpeer_tx, wpeer_rx) = unbounded();
        let (wpeer_open, open_rx) = unbounded();

        let tx = vec![
            TxDispatcher::<ToApp>::spawn(app_rx, events.clone())?,
            TxDispatcher::<ToSpeer>::spawn(speer_rx, events.clone())?,
            TxDispatcher::<ToWpeer>::spawn(wpeer_rx, events.clone())?,
        ];

        let spaces = self.spaces.unwrap_or_else(|| {
            Box::new(MemorySpacePool::new(config.ct, config.ms_count, config.ms_size))
        });
        let ports = BrokerPorts {
            app_tx,
            speer_tx,
            wpeer_tx,
            wpeer_open,
        };
        let serializer = Broker::new(local, config.limits(), spaces, ports, tracker.clone()).spawn(events_rx)?;

        let wpeer = WpeerManager::new(local.hello(), config.peer_timeout, events.clone()).spawn(open_rx)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let acceptors = vec![
            SpeerManager::new(peer_listener, events.clone(), tracker.clone(), shutdown.clone()).spawn()?,
            AppManager::new(app_listener, events.clone(), tracker.clone(), shutdown.clone()).spawn()?,
        ];

        let (stop_watcher, stop_rx) = bounded(1);
        let watcher = spawn_watcher(self.directory, config.directory_poll, events.clone(), stop_rx)?;

        let pid_path = config.pid_path();
        fs::write(&pid_path, std::process::id().to_string())
            .with_context(|| format!("writing {}", pid_path.display()))?;

        tracing::info!(
            ct = config.ct,
            socket = %config.app_socket.display(),
            %peer_addr,
            "rsktd started"
        );

        Ok(RunningDaemon {
            events,
            shutdown,
            stop_watcher: Some(stop_watcher),
            watcher: Some(watcher),
            serializer: Some(serializer),
            tx,
            acceptors,
            wpeer: Some(wpeer),
            app_socket: config.app_socket,
            pid_path,
            peer_addr,
            tracker,
            stopped: false,
        })
    }
}

/// Bind the Unix socket
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

            // Set directory permissions to 0700 (owner only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    // Remove stale socket if nobody answers on it
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            bail!("a daemon is already listening on {}", path.display());
        }
        fs::remove_file(path)?;
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;

    // Set socket permissions to 0600 (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

fn join<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(thread = name, "thread panicked");
            None
        }
    }
}

/// Handle to a started daemon; shuts it down on drop
pub struct RunningDaemon {
    events: Sender<Event>,
    shutdown: Arc<AtomicBool>,
    stop_watcher: Option<Sender<()>>,
    watcher: Option<JoinHandle<()>>,
    serializer: Option<JoinHandle<()>>,
    tx: Vec<JoinHandle<()>>,
    acceptors: Vec<JoinHandle<Vec<JoinHandle<()>>>>,
    wpeer: Option<JoinHandle<Vec<JoinHandle<()>>>>,
    app_socket: PathBuf,
    pid_path: PathBuf,
    peer_addr: SocketAddr,
    tracker: TaskTracker,
    stopped: bool,
}

impl RunningDaemon {
    pub fn app_socket_path(&self) -> &Path {
        &self.app_socket
    }

    /// Address the speer listener is bound to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Tasks currently alive anywhere in the daemon
    pub fn live_tasks(&self) -> usize {
        self.tracker.live()
    }

    /// Run in the foreground until SIGTERM or SIGINT, then shut down
    pub fn run_until_signalled(self) -> Result<()> {
        let term = Arc::new(AtomicBool::new(false));

        // Handle SIGTERM for graceful shutdown
        signal_hook::flag::register(signal::SIGTERM as i32, term.clone())?;

        // Handle SIGINT (Ctrl-C) for graceful shutdown
        signal_hook::flag::register(signal::SIGINT as i32, term.clone())?;

        while !term.load(Ordering::Relaxed) {
            thread::sleep(SIGNAL_POLL);
        }
        tracing::info!("signal received, shutting down");
        self.shutdown()
    }

    /// Stop accepting, fail everything outstanding and join all threads
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // No new applications or peers
        self.shutdown.store(true, Ordering::Relaxed);
        let mut receivers = Vec::new();
        for acceptor in self.acceptors.drain(..) {
            receivers.extend(join("acceptor", acceptor).unwrap_or_default());
        }
        self.stop_watcher.take();
        if let Some(watcher) = self.watcher.take() {
            join("directory", watcher);
        }

        // Serializer fails outstanding tasks and closes every link
        let _ = self.events.send(Event::Shutdown);
        if let Some(serializer) = self.serializer.take() {
            join("serializer", serializer);
        }
        if let Some(wpeer) = self.wpeer.take() {
            receivers.extend(join("wpeer", wpeer).unwrap_or_default());
        }
        for tx in self.tx.drain(..) {
            join("tx", tx);
        }
        for receiver in receivers {
            join("receiver", receiver);
        }

        let _ = fs::remove_file(&self.pid_path);
        if self.app_socket.exists() {
            fs::remove_file(&self.app_socket)
                .map_err(|e| anyhow!("removing {}: {}", self.app_socket.display(), e))?;
        }
        tracing::info!(live_tasks = self.tracker.live(), "rsktd stopped");
        Ok(())
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("shutdown: {}", e);
        }
    }
}
