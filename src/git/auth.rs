//! Per-home-directory git authentication and identity.
//!
//! Every repository handle owns a private home directory.  Authentication is
//! set up inside it once, and every later git invocation runs with the
//! environment produced here so it picks up that configuration and nothing
//! from the host user.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use tracing::debug;
use tracing::instrument;

use crate::clients::process::Invocation;
use crate::clients::process::ProcessRunner;
use crate::git::error::GitError;

/// Username embedded in HTTPS URLs when the credentials don't carry one.
pub const PLACEHOLDER_USERNAME: &str = "git";

const SSH_DIR: &str = ".ssh";
const SSH_KEY_FILE: &str = "id_promote";
const SSH_CONFIG_FILE: &str = "config";
const ASKPASS_FILE: &str = "askpass.sh";
const SIGNING_KEY_FILE: &str = "signing-key.asc";

const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  Username*) printf '%s\n' "$GIT_USERNAME" ;;
  *) printf '%s\n' "$GIT_PASSWORD" ;;
esac
"#;

// -----------------------------------------------------------------------------
// Types

/// Credentials for a remote.  Empty strings mean "not set"; an SSH key wins
/// over a password when both are present.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RepoCredentials {
    pub ssh_private_key: String,
    pub username: String,
    pub password: String,
}

/// Identity recorded on commits made from a home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorIdentity {
    pub name: String,
    pub email: String,
    /// ASCII-armored private key; commits are signed when set.
    pub signing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthOptions {
    pub credentials: Option<RepoCredentials>,
    pub author: AuthorIdentity,
    pub insecure_skip_tls_verify: bool,
}

/// Environment and remote URL for all git invocations under one home
/// directory.
#[derive(Clone, PartialEq, Eq)]
pub struct GitEnv {
    pub vars: Vec<(String, String)>,
    /// The URL git talks to, with the username embedded for HTTPS auth.
    pub access_url: String,
}

// -----------------------------------------------------------------------------
// impls

impl fmt::Debug for RepoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCredentials")
            .field("ssh_private_key", &redacted(&self.ssh_private_key))
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .finish()
    }
}

impl fmt::Debug for GitEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars: Vec<(&str, &str)> = self
            .vars
            .iter()
            .map(|(k, v)| {
                if k == "GIT_PASSWORD" {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("GitEnv")
            .field("vars", &vars)
            .field("access_url", &self.access_url)
            .finish()
    }
}

impl Default for AuthorIdentity {
    fn default() -> Self {
        Self {
            name: crate::config::DEFAULT_AUTHOR_NAME.to_string(),
            email: crate::config::DEFAULT_AUTHOR_EMAIL.to_string(),
            signing_key: None,
        }
    }
}

impl GitEnv {
    /// The environment every invocation gets, before any credentials.
    pub fn base(home: &Path, insecure_skip_tls_verify: bool) -> Self {
        let mut vars = vec![
            ("HOME".to_string(), home.display().to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string()),
        ];
        if insecure_skip_tls_verify {
            vars.push(("GIT_SSL_NO_VERIFY".to_string(), "true".to_string()));
        }
        Self {
            vars,
            access_url: String::new(),
        }
    }

    fn set(&mut self, key: &str, value: String) {
        self.vars.retain(|(k, _)| k != key);
        self.vars.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Prepare `home` for talking to `url` and return the environment to use.
///
/// Sets the commit identity, imports a signing key if configured, and then
/// installs exactly one of SSH key auth or HTTPS password auth.  Any failure
/// is returned as is; the caller discards the home directory.
#[instrument(skip_all, fields(home = %home.display()))]
pub async fn configure<R: ProcessRunner>(
    runner: &R,
    home: &Path,
    url: &str,
    opts: &AuthOptions,
) -> Result<GitEnv> {
    let mut env = GitEnv::base(home, opts.insecure_skip_tls_verify);
    env.access_url = url.to_string();

    let author = &opts.author;
    let name = non_empty_or(&author.name, crate::config::DEFAULT_AUTHOR_NAME);
    let email = non_empty_or(&author.email, crate::config::DEFAULT_AUTHOR_EMAIL);
    git_config_global(runner, home, &env, "user.name", name).await?;
    git_config_global(runner, home, &env, "user.email", email).await?;

    if let Some(key) = author.signing_key.as_deref().filter(|k| !k.is_empty()) {
        let key_path = home.join(SIGNING_KEY_FILE);
        write_private_file(&key_path, key).await?;
        let import = Invocation::new("gpg", home)
            .args(["--batch", "--import", &key_path.display().to_string()])
            .envs(&env.vars);
        let output = runner.run(&import).await?;
        if !output.success() {
            return Err(GitError::from_output(import.to_string(), &output).into());
        }
        git_config_global(runner, home, &env, "user.signingkey", email).await?;
        git_config_global(runner, home, &env, "commit.gpgsign", "true").await?;
        debug!("configured commit signing");
    }

    let Some(creds) = &opts.credentials else {
        return Ok(env);
    };

    if !creds.ssh_private_key.is_empty() {
        let ssh_dir = home.join(SSH_DIR);
        create_private_dir(&ssh_dir).await?;
        let key_path = ssh_dir.join(SSH_KEY_FILE);
        write_private_file(&key_path, &with_trailing_newline(&creds.ssh_private_key)).await?;
        let config_path = ssh_dir.join(SSH_CONFIG_FILE);
        let config = format!(
            "Host *\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n  IdentityFile {}\n  IdentitiesOnly yes\n",
            key_path.display()
        );
        write_private_file(&config_path, &config).await?;
        env.set(
            "GIT_SSH_COMMAND",
            format!("ssh -F {}", config_path.display()),
        );
        debug!("configured ssh key authentication");
        return Ok(env);
    }

    if !creds.password.is_empty() && is_http_url(url) {
        let username = non_empty_or(&creds.username, PLACEHOLDER_USERNAME);
        let askpass = home.join(ASKPASS_FILE);
        write_executable_file(&askpass, ASKPASS_SCRIPT).await?;
        env.set("GIT_ASKPASS", askpass.display().to_string());
        env.set("GIT_USERNAME", username.to_string());
        env.set("GIT_PASSWORD", creds.password.clone());
        env.access_url = with_username(url, username)?;
        debug!("configured password authentication");
    }

    Ok(env)
}

/// Whether `url` is an HTTP(S) remote.
pub fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

/// Replace any user info in an HTTP(S) URL with `username`.
pub fn with_username(url: &str, username: &str) -> Result<String> {
    let Some((scheme, rest)) = url.split_once("://") else {
        bail!("URL has no scheme: {}", url);
    };
    let rest = strip_userinfo_part(rest);
    let encoded = username.replace('%', "%25").replace('@', "%40").replace(':', "%3A");
    Ok(format!("{}://{}@{}", scheme, encoded, rest))
}

/// Drop user info from an HTTP(S) URL.  Other URLs are returned unchanged.
pub fn strip_userinfo(url: &str) -> String {
    if !is_http_url(url) {
        return url.to_string();
    }
    match url.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}", scheme, strip_userinfo_part(rest)),
        None => url.to_string(),
    }
}

fn strip_userinfo_part(rest: &str) -> &str {
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    }
}

async fn git_config_global<R: ProcessRunner>(
    runner: &R,
    home: &Path,
    env: &GitEnv,
    key: &str,
    value: &str,
) -> Result<()> {
    let invocation = Invocation::new("git", home)
        .args(["config", "--global", key, value])
        .envs(&env.vars);
    let output = runner.run(&invocation).await?;
    if !output.success() {
        return Err(GitError::from_output(invocation.to_string(), &output).into());
    }
    Ok(())
}

async fn create_private_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    set_mode(path, 0o700).await
}

async fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, 0o600).await
}

async fn write_executable_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, 0o700).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

fn with_trailing_newline(key: &str) -> String {
    if key.ends_with('\n') {
        key.to_string()
    } else {
        format!("{}\n", key)
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() { "" } else { "<redacted>" }
}
