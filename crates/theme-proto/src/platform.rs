use std::path::PathBuf;

pub const HOST_TCP_PORT: u16 = 9877;
pub const BACKEND_TCP_PORT: u16 = 9878;

const LOCAL_HOST: &str = "127.0.0.1";
const APP_DIR: &str = "game-theme-music";

pub fn backend_address() -> String {
    format!("{}:{}", LOCAL_HOST, BACKEND_TCP_PORT)
}

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/game-theme-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "game-theme-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

pub fn data_dir() -> PathBuf {
    // XDG layout on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Find mpv binary for playback.
/// Checks `MPV_PATH`, then beside the current exe, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let separator = ":";
    #[cfg(windows)]
    let separator = ";";

    path.split(separator)
        .map(|dir| PathBuf::from(dir).join(exe_name))
        .find(|p| p.exists())
}
