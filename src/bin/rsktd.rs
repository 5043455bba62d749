//! RSKT daemon binary
//!
//! Provides commands to start, stop, and inspect the daemon.

use anyhow::{anyhow, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rsktd::daemon::client::RsktClient;
use rsktd::daemon::config::DaemonConfig;
use rsktd::daemon::server::DaemonServer;
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config = DaemonConfig::load();
    let command = &args[1];

    match command.as_str() {
        "start" => start_daemon(config),
        "stop" => stop_daemon(&config),
        "status" => check_status(&config),
        "restart" => restart_daemon(config),
        "help" | "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_daemon(config: DaemonConfig) -> Result<()> {
    rsktd::logging::init(&config.log_level);

    if RsktClient::is_daemon_running(&config.app_socket) {
        eprintln!("Error: Daemon is already running at {}", config.app_socket.display());
        eprintln!("Use 'rsktd stop' to stop it first, or 'rsktd restart' to restart.");
        process::exit(1);
    }

    println!(
        "Starting RSKT daemon (component tag {:#x}) at {}",
        config.ct,
        config.app_socket.display()
    );
    println!("Press Ctrl-C to stop the daemon.");

    let daemon = DaemonServer::new(config).start()?;
    daemon.run_until_signalled()
}

fn read_pid(pid_path: &Path) -> Result<i32> {
    let pid_str = fs::read_to_string(pid_path)?;
    pid_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", pid_path.display()))
}

fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    let socket_path = &config.app_socket;
    let pid_path = config.pid_path();

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if !RsktClient::is_daemon_running(socket_path) {
        // Socket exists but can't connect - likely stale
        println!("Removing stale socket file.");
        fs::remove_file(socket_path)?;
        fs::remove_file(&pid_path).ok();
        return Ok(());
    }

    if !pid_path.exists() {
        eprintln!("Warning: PID file not found. Cannot send signal to daemon.");
        eprintln!("You may need to manually kill the daemon process.");
        return Ok(());
    }

    let pid = read_pid(&pid_path)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow!("Failed to signal daemon (PID {}): {}", pid, e))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    eprintln!("Warning: Daemon may not have stopped cleanly.");
    Ok(())
}

fn check_status(config: &DaemonConfig) -> Result<()> {
    let socket_path = &config.app_socket;

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if !RsktClient::is_daemon_running(socket_path) {
        println!("Socket file exists but daemon is not responding.");
        println!("This may be a stale socket. Try 'rsktd restart'.");
        return Ok(());
    }

    println!("Daemon is running at {}", socket_path.display());
    if let Ok(pid) = read_pid(&config.pid_path()) {
        println!("PID: {}", pid);
    }

    // A HELLO confirms the daemon is serving requests
    let ct = RsktClient::connect(socket_path).and_then(|mut client| client.hello("rsktd-status"));
    match ct {
        Ok(ct) => println!("Component tag: {:#x}", ct),
        Err(e) => println!("Daemon did not answer HELLO: {}", e),
    }

    Ok(())
}

fn restart_daemon(config: DaemonConfig) -> Result<()> {
    println!("Stopping daemon...");
    stop_daemon(&config)?;

    // Brief pause to ensure cleanup
    thread::sleep(Duration::from_millis(500));

    println!("Starting daemon...");
    start_daemon(config)
}

fn print_usage() {
    println!("RSKT Daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: rsktd <command>");
    println!();
    println!("Commands:");
    println!("  start      Start the daemon in the foreground");
    println!("  stop       Stop a running daemon");
    println!("  status     Check daemon status");
    println!("  restart    Restart the daemon");
    println!("  help       Show this help message");
    println!();
    println!("Configuration is read from $RSKTD_CONFIG or ~/.rsktd/rsktd.conf.");
    println!("RUST_LOG overrides the RSKTD_LOG filter from the config file.");
}
