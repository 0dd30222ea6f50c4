//! SSH Config Merger
//!
//! Parses ~/.ssh/config into an ordered document of host blocks and rewrites
//! the blocks ghswitch owns while leaving everything else byte-for-byte intact.
//!
//! Layout of a merged file:
//!
//! ```text
//! <global directives that preceded the first Host line>
//!
//! # ghswitch: managed block, rewritten on every identity switch
//! # ghswitch: generated 2026-10-19T08:00:00Z
//! # ghswitch: managed host github.com
//! Host github.com
//!     HostName github.com
//!     User git
//!     IdentityFile "/home/me/.ssh/id_ed25519_work"
//!     IdentitiesOnly yes
//!     ...
//!
//! <every foreign block, in original order>
//! ```
//!
//! A block is managed when its only pattern is a platform host, or when it
//! directly follows a `# ghswitch:` marker line. Marker lines are always dropped
//! and regenerated. Global directives stay above the managed section because
//! ssh applies them unconditionally only before the first `Host` line.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::platform::PlatformHost;

/// Prefix of every line ghswitch writes outside host blocks
pub const MARKER_PREFIX: &str = "# ghswitch:";

const HEADER_NOTICE: &str = "# ghswitch: managed block, rewritten on every identity switch";
const HEADER_STAMP: &str = "# ghswitch: generated ";
const HOST_MARKER: &str = "# ghswitch: managed host ";

/// Backup file name prefix, next to the config file
const BACKUP_INFIX: &str = "ghswitch-backup";

/// One process-wide lock around read + merge + write of the SSH config
static INSTALL_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// SSH config errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Expand ~ to home directory
pub fn expand_tilde(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(value)
}

/// Split a directive line into keyword and value.
///
/// Accepts `Key Value`, `Key=Value` and `Key = Value`.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (key, rest) = line.split_at(end);
    if key.is_empty() {
        return None;
    }
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    Some((key, rest))
}

/// Split a value into words, honouring double quotes
fn split_words(value: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;

    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

fn quote(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

fn is_trivia(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Block opener keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Host,
    Match,
}

/// One `Host`/`Match` section, kept as its original lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBlock {
    /// Comments and blank lines directly above the header line
    pub leading: Vec<String>,
    /// The `Host ...` / `Match ...` line as written
    pub header: String,
    pub kind: BlockKind,
    pub patterns: Vec<String>,
    /// Directive lines (and interior comments) as written
    pub body: Vec<String>,
    /// Preceded by a ghswitch marker line
    pub marked: bool,
    /// 1-based line number of the header
    pub line: usize,
}

impl HostBlock {
    /// Whether ghswitch owns this block
    pub fn is_managed(&self, platform_hosts: &[String]) -> bool {
        if self.kind != BlockKind::Host {
            return false;
        }
        self.marked
            || (self.patterns.len() == 1
                && platform_hosts
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(&self.patterns[0])))
    }

    /// Values of every occurrence of a directive (case-insensitive keyword)
    pub fn directive_values(&self, key: &str) -> Vec<String> {
        self.body
            .iter()
            .filter(|line| !is_trivia(line))
            .filter_map(|line| split_directive(line))
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.to_string())
            .collect()
    }

    /// IdentityFile paths, unquoted and tilde-expanded
    pub fn identity_files(&self) -> Vec<PathBuf> {
        self.directive_values("IdentityFile")
            .iter()
            .filter_map(|v| split_words(v).ok())
            .filter_map(|words| words.into_iter().next())
            .map(|v| expand_tilde(&v))
            .collect()
    }

    fn render(&self, out: &mut Vec<String>) {
        let start = self
            .leading
            .iter()
            .position(|l| !l.trim().is_empty())
            .unwrap_or(self.leading.len());
        out.extend(self.leading[start..].iter().cloned());
        out.push(self.header.clone());

        let end = self
            .body
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        out.extend(self.body[..end].iter().cloned());
    }
}

/// Parsed SSH config: global directives plus ordered host blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigDocument {
    /// Lines before the first `Host`/`Match` line
    pub preamble: Vec<String>,
    pub blocks: Vec<HostBlock>,
}

impl SshConfigDocument {
    /// Parse SSH config content string
    pub fn parse(content: &str) -> Result<Self, SshConfigError> {
        let mut doc = SshConfigDocument::default();
        let mut current: Option<HostBlock> = None;
        let mut pending: Vec<String> = Vec::new();
        let mut marker_seen = false;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = raw.trim();

            if trimmed.starts_with(MARKER_PREFIX) {
                // Marker lines are regenerated; whatever precedes them stays with its owner
                let target = match current.as_mut() {
                    Some(block) => &mut block.body,
                    None => &mut doc.preamble,
                };
                target.append(&mut pending);
                marker_seen = true;
                continue;
            }

            if is_trivia(raw) {
                pending.push(raw.to_string());
                continue;
            }

            let (key, value) = split_directive(trimmed).ok_or_else(|| SshConfigError::Parse {
                line: line_no,
                message: "malformed directive".to_string(),
            })?;
            let words = split_words(value).map_err(|message| SshConfigError::Parse {
                line: line_no,
                message,
            })?;

            let kind = if key.eq_ignore_ascii_case("host") {
                Some(BlockKind::Host)
            } else if key.eq_ignore_ascii_case("match") {
                Some(BlockKind::Match)
            } else {
                None
            };

            match kind {
                Some(kind) => {
                    if words.is_empty() {
                        return Err(SshConfigError::Parse {
                            line: line_no,
                            message: format!("{} without a pattern", key),
                        });
                    }
                    if let Some(block) = current.take() {
                        doc.blocks.push(block);
                    }
                    current = Some(HostBlock {
                        leading: std::mem::take(&mut pending),
                        header: raw.to_string(),
                        kind,
                        patterns: words,
                        body: Vec::new(),
                        marked: std::mem::take(&mut marker_seen),
                        line: line_no,
                    });
                }
                None => {
                    let target = match current.as_mut() {
                        Some(block) => &mut block.body,
                        None => &mut doc.preamble,
                    };
                    target.append(&mut pending);
                    target.push(raw.to_string());
                }
            }
        }

        match current {
            Some(mut block) => {
                block.body.append(&mut pending);
                doc.blocks.push(block);
            }
            None => doc.preamble.append(&mut pending),
        }

        Ok(doc)
    }

    /// The managed block for a platform host, if any
    pub fn managed_block(&self, host: &str) -> Option<&HostBlock> {
        let hosts = [host.to_string()];
        self.blocks.iter().find(|b| {
            b.is_managed(&hosts) && b.patterns.iter().any(|p| p.eq_ignore_ascii_case(host))
        })
    }

    /// Blocks ghswitch does not own, in document order
    pub fn foreign_blocks<'a>(
        &'a self,
        platform_hosts: &'a [String],
    ) -> impl Iterator<Item = &'a HostBlock> + 'a {
        self.blocks.iter().filter(move |b| !b.is_managed(platform_hosts))
    }

    /// Reject documents where dropping managed blocks would lose foreign settings
    fn check_conflicts(&self, platform_hosts: &[String]) -> Result<(), SshConfigError> {
        for block in &self.blocks {
            if block.kind != BlockKind::Host || block.is_managed(platform_hosts) {
                continue;
            }
            let shared = block.patterns.iter().find(|p| {
                platform_hosts.iter().any(|h| h.eq_ignore_ascii_case(p))
            });
            if let Some(host) = shared {
                return Err(SshConfigError::Parse {
                    line: block.line,
                    message: format!(
                        "'{}' shares a Host line with other patterns; split it into its own block",
                        host
                    ),
                });
            }
        }
        Ok(())
    }
}

/// The host block ghswitch writes for the active identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedHostBlock {
    pub host: String,
    pub hostname: String,
    pub user: String,
    pub identity_file: PathBuf,
    pub identities_only: bool,
}

impl ManagedHostBlock {
    pub fn new(platform: &PlatformHost, identity_file: &Path, identities_only: bool) -> Self {
        Self {
            host: platform.ssh_host.clone(),
            hostname: platform.ssh_host.clone(),
            user: platform.ssh_user.clone(),
            identity_file: identity_file.to_path_buf(),
            identities_only,
        }
    }

    fn render(&self, out: &mut Vec<String>) {
        out.push(format!("{}{}", HOST_MARKER, self.host));
        out.push(format!("Host {}", self.host));

        let mut directives = vec![
            ("HostName", self.hostname.clone()),
            ("User", self.user.clone()),
            (
                "IdentityFile",
                format!("\"{}\"", self.identity_file.to_string_lossy()),
            ),
        ];
        if self.identities_only {
            directives.push(("IdentitiesOnly", "yes".to_string()));
        }
        directives.extend([
            ("PreferredAuthentications", "publickey".to_string()),
            // The agent controller decides what is loaded, not ssh
            ("AddKeysToAgent", "no".to_string()),
            ("IgnoreUnknown", "UseKeychain".to_string()),
            ("UseKeychain", "no".to_string()),
        ]);

        for (key, value) in directives {
            out.push(format!("    {} {}", key, value));
        }
    }
}

/// Merge managed blocks into an existing config.
///
/// Managed blocks and marker lines from `existing` are dropped; the new
/// blocks are written after the global directives; foreign blocks follow in
/// their original order with their original text.
pub fn merge(
    existing: &str,
    managed: &[ManagedHostBlock],
    platform_hosts: &[String],
    generated_at: DateTime<Utc>,
) -> Result<String, SshConfigError> {
    let doc = SshConfigDocument::parse(existing)?;

    let mut hosts: Vec<String> = platform_hosts.to_vec();
    for block in managed {
        if !hosts.iter().any(|h| h.eq_ignore_ascii_case(&block.host)) {
            hosts.push(block.host.clone());
        }
    }
    doc.check_conflicts(&hosts)?;

    // Last block wins when the same host is supplied twice
    let mut unique: Vec<&ManagedHostBlock> = Vec::new();
    for block in managed {
        unique.retain(|b| !b.host.eq_ignore_ascii_case(&block.host));
        unique.push(block);
    }

    let mut out: Vec<String> = Vec::new();

    let preamble_end = doc
        .preamble
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    if preamble_end > 0 {
        out.extend(doc.preamble[..preamble_end].iter().cloned());
        out.push(String::new());
    }

    if !unique.is_empty() {
        out.push(HEADER_NOTICE.to_string());
        out.push(format!(
            "{}{}",
            HEADER_STAMP,
            generated_at.format("%Y-%m-%dT%H:%M:%SZ")
        ));
        for block in &unique {
            block.render(&mut out);
        }
    }

    for block in doc.foreign_blocks(&hosts) {
        if out.last().is_some_and(|l| !l.is_empty()) {
            out.push(String::new());
        }
        block.render(&mut out);
    }

    if out.is_empty() {
        return Ok(String::new());
    }
    let mut text = out.join("\n");
    text.push('\n');
    Ok(text)
}

/// Drop the generated-at line so two merges can be compared
pub fn without_timestamp(content: &str) -> String {
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with(HEADER_STAMP))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result of an install
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The file was rewritten; `backup` holds the previous contents
    Written { backup: Option<PathBuf> },
    /// The merged document matched the existing file
    Unchanged,
}

/// Writes merged documents to the SSH config file
#[derive(Debug, Clone)]
pub struct SshConfigInstaller {
    path: PathBuf,
    backup_retention: usize,
}

impl SshConfigInstaller {
    pub fn new(path: PathBuf, backup_retention: usize) -> Self {
        Self {
            path,
            backup_retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the installed config (empty document when absent)
    pub fn read(&self) -> Result<SshConfigDocument, SshConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => SshConfigDocument::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SshConfigDocument::default()),
            Err(e) => Err(SshConfigError::Io(e)),
        }
    }

    /// IdentityFile of the managed block for `host`
    pub fn managed_identity_file(&self, host: &str) -> Result<Option<PathBuf>, SshConfigError> {
        let doc = self.read()?;
        Ok(doc
            .managed_block(host)
            .and_then(|b| b.identity_files().into_iter().next()))
    }

    /// Merge `managed` into the config file and write it atomically.
    ///
    /// An empty `managed` slice removes every managed block.
    pub fn install(
        &self,
        managed: &[ManagedHostBlock],
        platform_hosts: &[String],
    ) -> Result<InstallOutcome, SshConfigError> {
        let _guard = INSTALL_LOCK.lock();
        let target = self.write_target()?;

        let existing = match fs::read_to_string(&target) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SshConfigError::Io(e)),
        };

        let merged = merge(
            existing.as_deref().unwrap_or(""),
            managed,
            platform_hosts,
            Utc::now(),
        )?;

        if let Some(old) = existing.as_deref() {
            if without_timestamp(old) == without_timestamp(&merged) {
                restrict_to_owner(&target)?;
                tracing::debug!(path = %self.path.display(), "SSH config already up to date");
                return Ok(InstallOutcome::Unchanged);
            }
        }

        self.ensure_dir()?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let temp_path =
            target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        write_private(&temp_path, merged.as_bytes())?;

        let backup = match existing {
            Some(_) => match self.backup() {
                Ok(path) => Some(path),
                Err(e) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(e);
                }
            },
            None => None,
        };

        if let Err(e) = fs::rename(&temp_path, &target) {
            let _ = fs::remove_file(&temp_path);
            return Err(SshConfigError::Io(e));
        }

        tracing::info!(
            path = %self.path.display(),
            managed = managed.len(),
            "SSH config installed"
        );

        if let Err(e) = self.prune_backups() {
            tracing::warn!("Failed to prune SSH config backups: {}", e);
        }

        Ok(InstallOutcome::Written { backup })
    }

    /// File the rename lands on; a symlinked config keeps its link
    fn write_target(&self) -> Result<PathBuf, SshConfigError> {
        let is_link = fs::symlink_metadata(&self.path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return Ok(self.path.clone());
        }
        match fs::canonicalize(&self.path) {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Dangling link: write where it points
                let link = fs::read_link(&self.path)?;
                Ok(match self.path.parent() {
                    Some(parent) if link.is_relative() => parent.join(link),
                    _ => link,
                })
            }
            Err(e) => Err(SshConfigError::Io(e)),
        }
    }

    fn ensure_dir(&self) -> Result<(), SshConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }
        Ok(())
    }

    fn backup_prefix(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        format!("{}.{}.", file_name, BACKUP_INFIX)
    }

    /// Copy the current file to a timestamped backup next to it
    fn backup(&self) -> Result<PathBuf, SshConfigError> {
        let backup_path = self.path.with_file_name(format!(
            "{}{}",
            self.backup_prefix(),
            Utc::now().format("%Y%m%d_%H%M%S_%3f")
        ));
        let content = fs::read(&self.path)?;
        write_private(&backup_path, &content)?;
        tracing::debug!(backup = %backup_path.display(), "SSH config backed up");
        Ok(backup_path)
    }

    /// Backups next to the config file, oldest first
    pub fn backups(&self) -> Result<Vec<PathBuf>, SshConfigError> {
        let dir = match self.path.parent() {
            Some(dir) if dir.exists() => dir,
            _ => return Ok(Vec::new()),
        };
        let prefix = self.backup_prefix();
        let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect();
        backups.sort();
        Ok(backups)
    }

    fn prune_backups(&self) -> Result<(), SshConfigError> {
        let backups = self.backups()?;
        if backups.len() <= self.backup_retention {
            return Ok(());
        }
        let excess = backups.len() - self.backup_retention;
        for old in &backups[..excess] {
            fs::remove_file(old)?;
        }
        Ok(())
    }
}

/// chmod 0600 unless the file already is
fn restrict_to_owner(path: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        if mode != 0o600 {
            tracing::warn!(path = %path.display(), "SSH config had mode {:o}, restoring 0600", mode);
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Write a file that is owner read/write only from the moment it exists
fn write_private(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
