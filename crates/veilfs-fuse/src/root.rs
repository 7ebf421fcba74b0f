//! Encrypted-root initialization.
//!
//! The root is the in-memory handle representing the initialized volume
//! backing a mount: the backing directory, the validated volume
//! configuration, and the name-translation seam. Initialization resolves
//! the configuration document, obtains a password through the configured
//! source chain, and verifies it against the volume's key fingerprint.
//! Everything here runs before any thread is started or any operation
//! table is registered, so failures abort the session with nothing to
//! unwind.
//!
//! Cipher engines are pluggable; this build ships the null cipher only, so
//! volumes are gated behind `--insecure` and integrity-header enforcement
//! rejects them under `--require-macs`.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use veilfs_mount::SecretPool;

use crate::config::{ConfigMode, MountOpts};
use crate::error::RootInitError;

/// Environment variable naming the volume configuration file.
pub const CONFIG_ENV_VAR: &str = "VEILFS_CONFIG";
/// Environment variable read by `-E`.
pub const PASSWORD_ENV_VAR: &str = "VEILFS_PASSWORD";
/// Default configuration file name inside the backing directory.
pub const CONFIG_FILE_NAME: &str = ".veilfs.json";

const CONFIG_VERSION: u32 = 1;
const SALT_LEN: usize = 16;

/// The volume configuration document stored in the backing directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Document format version.
    pub version: u32,
    /// Cipher engine name.
    pub cipher: String,
    /// Hex-encoded key-derivation salt.
    pub key_salt: String,
    /// Hex-encoded fingerprint of the derived key.
    pub key_fingerprint: String,
    /// Per-file unique initialization vectors.
    pub unique_iv: bool,
    /// Blocks carry integrity headers.
    pub require_mac: bool,
}

/// Name-translation seam between virtual and backing names.
pub trait NameCoder: Send + Sync {
    /// Encodes a virtual name into its backing form.
    fn encode(&self, name: &OsStr) -> OsString;
}

/// Stores names verbatim (the null cipher's coder).
#[derive(Debug, Default)]
pub struct NullNameCoder;

impl NameCoder for NullNameCoder {
    fn encode(&self, name: &OsStr) -> OsString {
        name.to_os_string()
    }
}

/// The initialized volume backing a mount.
pub struct EncryptedRoot {
    root_dir: PathBuf,
    config: VolumeConfig,
    read_only: bool,
    reverse: bool,
    coder: Box<dyn NameCoder>,
}

impl std::fmt::Debug for EncryptedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedRoot")
            .field("root_dir", &self.root_dir)
            .field("cipher", &self.config.cipher)
            .field("read_only", &self.read_only)
            .field("reverse", &self.reverse)
            .finish_non_exhaustive()
    }
}

impl EncryptedRoot {
    /// The backing directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The validated volume configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Whether mutating operations are refused.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this session presents a reverse-encryption view.
    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// Maps a virtual path (relative to the mount) to its backing path.
    pub fn backing_path(&self, virtual_path: &Path) -> PathBuf {
        let mut backing = self.root_dir.clone();
        for component in virtual_path.components() {
            if let Component::Normal(name) = component {
                backing.push(self.coder.encode(name));
            }
        }
        backing
    }

    /// Whether `name` is the volume's own configuration document, which is
    /// hidden from the mounted view.
    pub fn is_config_name(&self, name: &OsStr) -> bool {
        name == OsStr::new(CONFIG_FILE_NAME)
    }
}

/// Initializes the encrypted root for the given mount options.
///
/// Obtains the password from the configured source chain, then delegates
/// to [`initialize_root_with_password`].
pub fn initialize_root(opts: &MountOpts) -> Result<Arc<EncryptedRoot>, RootInitError> {
    let password = acquire_password(opts)?;
    initialize_root_with_password(opts, &password)
}

/// Initializes the encrypted root with an already-obtained password.
pub fn initialize_root_with_password(
    opts: &MountOpts,
    password: &str,
) -> Result<Arc<EncryptedRoot>, RootInitError> {
    let root_dir = opts.root_dir_path().to_path_buf();
    let config_path = resolve_config_path(opts, &root_dir);

    let config = if config_path.is_file() {
        load_config(&config_path)?
    } else {
        create_config_for_empty_volume(opts, &root_dir, &config_path, password)?
    };

    if config.cipher == "null" && !opts.insecure {
        return Err(RootInitError::InsecureCipherRefused);
    }
    if opts.require_mac && !config.require_mac {
        return Err(RootInitError::MacsRequired);
    }

    if opts.check_key {
        let salt = hex_decode(&config.key_salt).ok_or_else(|| RootInitError::ConfigCorrupt {
            path: config_path.clone(),
            detail: "key salt is not valid hex".to_string(),
        })?;
        if key_fingerprint(&salt, password) != config.key_fingerprint {
            return Err(RootInitError::BadPassword);
        }
    }

    tracing::debug!(
        root = %root_dir.display(),
        cipher = %config.cipher,
        "encrypted root initialized"
    );

    Ok(Arc::new(EncryptedRoot {
        root_dir,
        config,
        read_only: opts.read_only,
        reverse: opts.reverse_encryption,
        coder: Box::new(NullNameCoder),
    }))
}

fn resolve_config_path(opts: &MountOpts, root_dir: &Path) -> PathBuf {
    if let Some(explicit) = &opts.config_path {
        return explicit.clone();
    }
    if let Ok(from_env) = std::env::var(CONFIG_ENV_VAR) {
        if !from_env.is_empty() {
            return PathBuf::from(from_env);
        }
    }
    root_dir.join(CONFIG_FILE_NAME)
}

fn load_config(path: &Path) -> Result<VolumeConfig, RootInitError> {
    let raw = std::fs::read_to_string(path)?;
    let config: VolumeConfig =
        serde_json::from_str(&raw).map_err(|e| RootInitError::ConfigCorrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if config.version != CONFIG_VERSION {
        return Err(RootInitError::UnsupportedVersion {
            found: config.version,
            expected: CONFIG_VERSION,
        });
    }
    Ok(config)
}

/// Creates a fresh volume configuration when the backing directory is a
/// brand-new (empty) volume. A non-empty directory without a configuration
/// is treated as missing, not silently re-keyed.
fn create_config_for_empty_volume(
    opts: &MountOpts,
    root_dir: &Path,
    config_path: &Path,
    password: &str,
) -> Result<VolumeConfig, RootInitError> {
    let occupied = std::fs::read_dir(root_dir)?.next().is_some();
    if occupied {
        return Err(RootInitError::ConfigNotFound(config_path.to_path_buf()));
    }

    // Only the null cipher is built in; creating a volume with it is an
    // explicit opt-in.
    if !opts.insecure {
        return Err(RootInitError::InsecureCipherRefused);
    }
    if opts.config_mode == ConfigMode::Paranoia {
        // Paranoia wants integrity headers, which the null cipher cannot
        // provide.
        return Err(RootInitError::MacsRequired);
    }

    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let config = VolumeConfig {
        version: CONFIG_VERSION,
        cipher: "null".to_string(),
        key_salt: hex_encode(&salt),
        key_fingerprint: key_fingerprint(&salt, password),
        unique_iv: opts.config_mode != ConfigMode::Default,
        require_mac: false,
    };

    let raw = serde_json::to_string_pretty(&config).map_err(|e| RootInitError::ConfigCorrupt {
        path: config_path.to_path_buf(),
        detail: e.to_string(),
    })?;
    std::fs::write(config_path, raw)?;
    tracing::info!(path = %config_path.display(), "created new volume configuration");

    Ok(config)
}

/// Obtains the password through the configured source chain: external
/// program, then stdin, then environment, then interactive prompt.
pub fn acquire_password(opts: &MountOpts) -> Result<Zeroizing<String>, RootInitError> {
    if let Some(program) = opts.password_program.as_deref() {
        if !program.is_empty() {
            return password_from_program(program, opts.root_dir_path());
        }
    }
    if opts.use_stdin {
        return password_from_stdin();
    }
    if opts.use_env_password {
        return match std::env::var(PASSWORD_ENV_VAR) {
            Ok(p) if !p.is_empty() => Ok(Zeroizing::new(p)),
            _ => Err(RootInitError::PasswordUnavailable(format!(
                "{PASSWORD_ENV_VAR} is unset or empty"
            ))),
        };
    }
    let prompted = rpassword::prompt_password("veilfs password: ")
        .map_err(|e| RootInitError::PasswordUnavailable(e.to_string()))?;
    if prompted.is_empty() {
        return Err(RootInitError::PasswordUnavailable(
            "empty password".to_string(),
        ));
    }
    Ok(Zeroizing::new(prompted))
}

fn password_from_program(
    program: &str,
    root_dir: &Path,
) -> Result<Zeroizing<String>, RootInitError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(program)
        .env("VEILFS_ROOT", root_dir)
        .output()
        .map_err(|e| {
            RootInitError::PasswordUnavailable(format!("failed to run '{program}': {e}"))
        })?;
    if !output.status.success() {
        return Err(RootInitError::PasswordUnavailable(format!(
            "password program '{program}' exited with {}",
            output.status
        )));
    }
    let mut text = Zeroizing::new(String::from_utf8_lossy(&output.stdout).into_owned());
    let line = text.lines().next().unwrap_or("").to_string();
    text.clear();
    if line.is_empty() {
        return Err(RootInitError::PasswordUnavailable(format!(
            "password program '{program}' produced no output"
        )));
    }
    Ok(Zeroizing::new(line))
}

fn password_from_stdin() -> Result<Zeroizing<String>, RootInitError> {
    let mut raw = Zeroizing::new(String::new());
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| RootInitError::PasswordUnavailable(e.to_string()))?;
    let line = raw
        .lines()
        .next()
        .unwrap_or("")
        .trim_end_matches('\r')
        .to_string();
    if line.is_empty() {
        return Err(RootInitError::PasswordUnavailable(
            "no password on standard input".to_string(),
        ));
    }
    Ok(Zeroizing::new(line))
}

/// Fingerprint of the key derived from `salt` and `password`.
///
/// Intermediate key material goes through the secret pool when one is
/// installed, so it is zeroed rather than left behind on the heap.
fn key_fingerprint(salt: &[u8], password: &str) -> String {
    let len = salt.len() + password.len();
    let mut material = match SecretPool::get() {
        Some(pool) => pool.acquire(len),
        None => Zeroizing::new(vec![0u8; len]),
    };
    material[..salt.len()].copy_from_slice(salt);
    material[salt.len()..].copy_from_slice(password.as_bytes());

    let digest = Sha256::digest(&material[..]);

    if let Some(pool) = SecretPool::get() {
        pool.release(material);
    }
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
