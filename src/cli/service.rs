//! Background process lifecycle: PID file, detached spawn, and a TCP probe
//! against the gateway port for `status`.

use anyhow::{Context, Result};
use openclaw_core::config::{state_dir, AppConfig};
use std::fs;
use std::net::TcpStream;
use std::process::Command;
use std::time::Duration;

fn pid_path() -> std::path::PathBuf {
    state_dir().join("openclaw.pid")
}

pub fn start() -> Result<()> {
    let pid_file = pid_path();
    if pid_file.exists() {
        let pid = fs::read_to_string(&pid_file)?;
        println!("openclaw already running (pid {})", pid.trim());
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .arg("run")
        .spawn()
        .context("failed to spawn openclaw in the background")?;

    fs::create_dir_all(state_dir())?;
    fs::write(&pid_file, child.id().to_string())?;
    println!("openclaw started (pid {})", child.id());
    Ok(())
}

pub fn stop() -> Result<()> {
    let pid_file = pid_path();
    if !pid_file.exists() {
        println!("openclaw is not running.");
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_file)?;
    let pid: i32 = pid_str.trim().parse().context("invalid pid file contents")?;
    println!("stopping openclaw (pid {pid})...");

    #[cfg(unix)]
    {
        Command::new("kill").arg(pid.to_string()).status().context("failed to send kill signal")?;
    }
    #[cfg(windows)]
    {
        Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status()
            .context("failed to run taskkill")?;
    }

    let _ = fs::remove_file(&pid_file);
    Ok(())
}

pub fn restart() -> Result<()> {
    stop()?;
    start()
}

pub fn status() -> Result<()> {
    let pid_file = pid_path();
    if !pid_file.exists() {
        println!("openclaw is not running.");
        return Ok(());
    }

    let config = AppConfig::load_or_default();
    let addr = format!("127.0.0.1:{}", config.gateway.port);
    match TcpStream::connect_timeout(&addr.parse()?, Duration::from_millis(500)) {
        Ok(_) => println!("openclaw is running and the gateway is reachable at {addr}."),
        Err(_) => println!("a pid file exists but the gateway at {addr} is not reachable."),
    }
    Ok(())
}
