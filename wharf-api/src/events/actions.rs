//! Event actions
//!
//! Typed actions referenced by rules: HTTP callbacks, commands, email,
//! retention sweeps, filesystem mutations and provider maintenance.
//! Execution substitutes `{{Placeholder}}` values from the triggering
//! event before running.

use super::EventContext;
use crate::config::SmtpConfig;
use crate::provider::DataProvider;
use crate::util;
use crate::vfs::{Fs as _, FsRead as _, FsWrite as _, VirtualFs, WriteFlags};
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wharf_common::{Error, Permission, Result};

/// A named, typed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventAction {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub options: EventActionOptions,
}

impl EventAction {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        self.options.validate()
    }

    /// Stable integer for the persistence layer.
    pub fn type_id(&self) -> i32 {
        match self.options {
            EventActionOptions::Http(_) => 1,
            EventActionOptions::Command(_) => 2,
            EventActionOptions::Email(_) => 3,
            EventActionOptions::Backup => 4,
            EventActionOptions::UserQuotaReset => 5,
            EventActionOptions::FolderQuotaReset => 6,
            EventActionOptions::TransferQuotaReset => 7,
            EventActionOptions::DataRetentionCheck(_) => 8,
            EventActionOptions::Filesystem(_) => 9,
            EventActionOptions::PasswordExpirationCheck(_) => 10,
            EventActionOptions::IdpAccountCheck => 11,
        }
    }
}

/// Tagged union of the action configurations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum EventActionOptions {
    Http(HttpActionConfig),
    Command(CommandActionConfig),
    Email(EmailActionConfig),
    Backup,
    UserQuotaReset,
    FolderQuotaReset,
    TransferQuotaReset,
    DataRetentionCheck(RetentionActionConfig),
    Filesystem(FsActionConfig),
    PasswordExpirationCheck(PasswordExpirationConfig),
    IdpAccountCheck,
}

impl EventActionOptions {
    fn validate(&self) -> Result<()> {
        match self {
            EventActionOptions::Http(c) => c.validate(),
            EventActionOptions::Command(c) => c.validate(),
            EventActionOptions::Email(c) => c.validate(),
            EventActionOptions::DataRetentionCheck(c) => c.validate(),
            EventActionOptions::Filesystem(c) => c.validate(),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpPart {
    pub name: String,
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpActionConfig {
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub query_parameters: Vec<KeyValue>,
    #[serde(default)]
    pub body: String,
    /// Multipart parts; mutually exclusive with `body`.
    #[serde(default)]
    pub parts: Vec<HttpPart>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl HttpActionConfig {
    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Validation(
                "field \"endpoint\" is required".to_string(),
            ));
        }
        url::Url::parse(&self.endpoint)
            .map_err(|_| Error::Validation("field \"endpoint\" is not a valid URL".to_string()))?;
        if !self.body.is_empty() && !self.parts.is_empty() {
            return Err(Error::Validation(
                "body and multipart parts are mutually exclusive".to_string(),
            ));
        }
        match self.method.as_str() {
            "" | "GET" | "POST" | "PUT" | "DELETE" => Ok(()),
            other => Err(Error::Validation(format!(
                "unsupported HTTP method {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandActionConfig {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<KeyValue>,
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CommandActionConfig {
    fn validate(&self) -> Result<()> {
        if !self.cmd.starts_with('/') {
            return Err(Error::Validation(
                "field \"cmd\" must be an absolute path".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailActionConfig {
    pub recipients: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Virtual paths resolved against the triggering user's tree.
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl EmailActionConfig {
    fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::Validation(
                "at least one recipient is required".to_string(),
            ));
        }
        for recipient in &self.recipients {
            if !crate::validation::is_valid_email(recipient) {
                return Err(Error::Validation(format!(
                    "invalid recipient {:?}",
                    recipient
                )));
            }
        }
        if self.subject.is_empty() {
            return Err(Error::Validation(
                "field \"subject\" is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FolderRetention {
    pub path: String,
    /// Files older than this many hours are removed.
    pub retention_hours: i64,
    #[serde(default)]
    pub delete_empty_dirs: bool,
    /// Administrative sweep: skip the user's delete permission check.
    #[serde(default)]
    pub ignore_user_permissions: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionActionConfig {
    pub folders: Vec<FolderRetention>,
}

impl RetentionActionConfig {
    fn validate(&self) -> Result<()> {
        if self.folders.is_empty() {
            return Err(Error::Validation(
                "at least one retention folder is required".to_string(),
            ));
        }
        for folder in &self.folders {
            if folder.retention_hours <= 0 {
                return Err(Error::Validation(format!(
                    "invalid retention for {:?}",
                    folder.path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FsActionConfig {
    /// source → target rename map.
    #[serde(default)]
    pub renames: Vec<KeyValue>,
    #[serde(default)]
    pub mkdirs: Vec<String>,
    #[serde(default)]
    pub deletes: Vec<String>,
    /// Paths that must exist; any missing one fails the action.
    #[serde(default)]
    pub exist: Vec<String>,
    /// Compress these paths into the named zip archive.
    #[serde(default)]
    pub compress: Option<FsCompress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FsCompress {
    pub name: String,
    pub paths: Vec<String>,
}

impl FsActionConfig {
    fn validate(&self) -> Result<()> {
        let has_work = !self.renames.is_empty()
            || !self.mkdirs.is_empty()
            || !self.deletes.is_empty()
            || !self.exist.is_empty()
            || self.compress.is_some();
        if !has_work {
            return Err(Error::Validation(
                "the filesystem action is empty".to_string(),
            ));
        }
        for rename in &self.renames {
            if util::clean_path(&rename.key) == "/" {
                return Err(Error::Validation(
                    "the root path cannot be renamed".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PasswordExpirationConfig {
    /// Notify users whose password expires within this many days.
    pub threshold_days: i64,
}

/// Substitute `{{Name}}`-style placeholders from the event context.
pub fn replace_placeholders(template: &str, event: &EventContext) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let pairs: [(&str, &str); 10] = [
        ("{{Event}}", event.event_name()),
        ("{{Name}}", &event.username),
        ("{{User}}", &event.username),
        ("{{VirtualPath}}", &event.virtual_path),
        ("{{VirtualTargetPath}}", &event.virtual_target_path),
        ("{{FsPath}}", &event.fs_path),
        ("{{ObjectName}}", &event.object_name),
        ("{{ObjectData}}", &event.object_data),
        ("{{Protocol}}", &event.protocol),
        ("{{IP}}", &event.ip),
    ];
    let mut out = template.to_string();
    for (placeholder, value) in pairs {
        if out.contains(placeholder) {
            out = out.replace(placeholder, value);
        }
    }
    if out.contains("{{FileSize}}") {
        out = out.replace("{{FileSize}}", &event.file_size.to_string());
    }
    if out.contains("{{Timestamp}}") {
        out = out.replace("{{Timestamp}}", &event.timestamp.to_string());
    }
    if out.contains("{{StatusString}}") {
        let status = if event.status == 1 { "OK" } else { "KO" };
        out = out.replace("{{StatusString}}", status);
    }
    out
}

/// Runs the concrete action types.
pub struct ActionExecutor {
    provider: Arc<DataProvider>,
    smtp: SmtpConfig,
    http_client: reqwest::Client,
    insecure_http_client: reqwest::Client,
}

impl ActionExecutor {
    pub fn new(provider: Arc<DataProvider>, smtp: SmtpConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let insecure_http_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            provider,
            smtp,
            http_client,
            insecure_http_client,
        }
    }

    pub async fn execute(&self, action: &EventAction, event: &EventContext) -> Result<()> {
        match &action.options {
            EventActionOptions::Http(config) => self.execute_http(config, event).await,
            EventActionOptions::Command(config) => self.execute_command(config, event).await,
            EventActionOptions::Email(config) => self.execute_email(config, event).await,
            EventActionOptions::Backup => self.execute_backup().await,
            EventActionOptions::UserQuotaReset => self.execute_user_quota_reset(event).await,
            EventActionOptions::FolderQuotaReset => self.execute_folder_quota_reset(event).await,
            EventActionOptions::TransferQuotaReset => {
                self.provider
                    .transactional_transfer_quota_update(&event.username, 0, 0, true)
                    .await
            }
            EventActionOptions::DataRetentionCheck(config) => {
                self.execute_retention(config, event).await
            }
            EventActionOptions::Filesystem(config) => self.execute_fs(config, event).await,
            EventActionOptions::PasswordExpirationCheck(config) => {
                self.execute_password_expiration(config).await
            }
            EventActionOptions::IdpAccountCheck => Err(Error::OperationUnsupported(
                "no identity provider is configured".to_string(),
            )),
        }
    }

    async fn execute_http(&self, config: &HttpActionConfig, event: &EventContext) -> Result<()> {
        let endpoint = replace_placeholders(&config.endpoint, event);
        let method = match config.method.as_str() {
            "" | "POST" => reqwest::Method::POST,
            "GET" => reqwest::Method::GET,
            "PUT" => reqwest::Method::PUT,
            "DELETE" => reqwest::Method::DELETE,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported HTTP method {:?}",
                    other
                )))
            }
        };
        let client = if config.skip_tls_verify {
            &self.insecure_http_client
        } else {
            &self.http_client
        };
        let timeout = Duration::from_secs(if config.timeout_secs == 0 {
            20
        } else {
            config.timeout_secs
        });
        let mut request = client.request(method, &endpoint).timeout(timeout);
        for header in &config.headers {
            request = request.header(&header.key, replace_placeholders(&header.value, event));
        }
        let query: Vec<(String, String)> = config
            .query_parameters
            .iter()
            .map(|kv| (kv.key.clone(), replace_placeholders(&kv.value, event)))
            .collect();
        if !query.is_empty() {
            request = request.query(&query);
        }
        if !config.username.is_empty() {
            request = request.basic_auth(&config.username, Some(&config.password));
        }
        if !config.parts.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for part in &config.parts {
                let body = replace_placeholders(&part.body, event);
                form = form.part(
                    part.name.clone(),
                    reqwest::multipart::Part::text(body).file_name(part.filepath.clone()),
                );
            }
            request = request.multipart(form);
        } else if !config.body.is_empty() {
            request = request.body(replace_placeholders(&config.body, event));
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("HTTP action to {:?}", endpoint))
            } else {
                Error::Internal(format!("HTTP action failed: {}", e))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Internal(format!(
                "HTTP action to {:?} returned {}",
                endpoint, status
            )));
        }
        tracing::debug!(endpoint = %endpoint, status = %status, "HTTP action completed");
        Ok(())
    }

    async fn execute_command(
        &self,
        config: &CommandActionConfig,
        event: &EventContext,
    ) -> Result<()> {
        let timeout = Duration::from_secs(if config.timeout_secs == 0 {
            30
        } else {
            config.timeout_secs
        });
        let mut command = tokio::process::Command::new(&config.cmd);
        command
            .args(
                config
                    .args
                    .iter()
                    .map(|a| replace_placeholders(a, event)),
            )
            .current_dir(std::env::temp_dir())
            .kill_on_drop(true);
        for env in &config.env_vars {
            command.env(&env.key, replace_placeholders(&env.value, event));
        }
        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("command spawn failed: {}", e)))?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(Error::Internal(format!(
                "command {:?} exited with {}",
                config.cmd, status
            ))),
            Ok(Err(e)) => Err(Error::Internal(format!("command wait failed: {}", e))),
            Err(_) => {
                // SIGTERM first, SIGKILL after a grace period.
                if let Some(pid) = child.id() {
                    let pid = nix::unistd::Pid::from_raw(pid as i32);
                    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if child.try_wait().ok().flatten().is_none() {
                        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                }
                Err(Error::Timeout(format!("command {:?}", config.cmd)))
            }
        }
    }

    async fn execute_email(&self, config: &EmailActionConfig, event: &EventContext) -> Result<()> {
        if !self.smtp.is_enabled() {
            return Err(Error::Validation(
                "SMTP is not configured".to_string(),
            ));
        }
        let subject = replace_placeholders(&config.subject, event);
        let body = replace_placeholders(&config.body, event);
        let mut builder = Message::builder()
            .from(
                self.smtp
                    .from
                    .parse()
                    .map_err(|e| Error::Validation(format!("invalid from address: {}", e)))?,
            )
            .subject(subject);
        for recipient in &config.recipients {
            builder = builder.to(recipient
                .parse()
                .map_err(|e| Error::Validation(format!("invalid recipient: {}", e)))?);
        }
        let message = if config.attachments.is_empty() {
            builder
                .body(body)
                .map_err(|e| Error::Internal(format!("email build failed: {}", e)))?
        } else {
            let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(body));
            let attachments = self.load_attachments(config, event).await?;
            for (name, data) in attachments {
                multipart = multipart.singlepart(
                    Attachment::new(name).body(
                        data,
                        "application/octet-stream".parse().unwrap(),
                    ),
                );
            }
            builder
                .multipart(multipart)
                .map_err(|e| Error::Internal(format!("email build failed: {}", e)))?
        };
        let mut transport_builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)
                .map_err(|e| Error::Internal(format!("SMTP setup failed: {}", e)))?;
        if self.smtp.port != 0 {
            transport_builder = transport_builder.port(self.smtp.port);
        }
        if !self.smtp.username.is_empty() {
            transport_builder = transport_builder.credentials(
                lettre::transport::smtp::authentication::Credentials::new(
                    self.smtp.username.clone(),
                    self.smtp.password.clone(),
                ),
            );
        }
        transport_builder
            .build()
            .send(message)
            .await
            .map_err(|e| Error::Internal(format!("email send failed: {}", e)))?;
        Ok(())
    }

    /// Resolve attachment paths against the triggering user's VFS,
    /// enforcing the configured total size cap.
    async fn load_attachments(
        &self,
        config: &EmailActionConfig,
        event: &EventContext,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let user = self.provider.get_effective_user(&event.username).await?;
        let vfs = VirtualFs::for_user(&user, &self.kms_handle())?;
        let max_size = if self.smtp.max_attachment_size > 0 {
            self.smtp.max_attachment_size
        } else {
            10 * 1024 * 1024
        };
        let mut total = 0i64;
        let mut out = Vec::new();
        for path in &config.attachments {
            let path = replace_placeholders(path, event);
            let resolved = vfs.resolve(&path);
            let mut reader = resolved.fs.open_read(&resolved.fs_path, 0).await?;
            let mut data = Vec::new();
            loop {
                let chunk = reader.read_chunk(64 * 1024).await?;
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len() as i64;
                if total > max_size {
                    reader.close().await?;
                    return Err(Error::Validation(format!(
                        "attachments exceed the {} byte limit",
                        max_size
                    )));
                }
                data.extend_from_slice(&chunk);
            }
            reader.close().await?;
            out.push((util::base_name(&path), data));
        }
        Ok(out)
    }

    async fn execute_backup(&self) -> Result<()> {
        let data = crate::provider::dump::dump(self.provider.pool()).await?;
        let serialized = serde_json::to_vec_pretty(&data)
            .map_err(|e| Error::Internal(format!("backup serialization failed: {}", e)))?;
        let path = std::env::temp_dir().join(format!("wharf-backup-{}.json", util::now_ms()));
        tokio::fs::write(&path, serialized)
            .await
            .map_err(|e| Error::Internal(format!("backup write failed: {}", e)))?;
        tracing::info!(path = %path.display(), "provider backup written");
        Ok(())
    }

    async fn execute_user_quota_reset(&self, event: &EventContext) -> Result<()> {
        let user = self.provider.get_effective_user(&event.username).await?;
        let vfs = VirtualFs::for_user(&user, &self.kms_handle())?;
        let resolved = vfs.resolve("/");
        let entries = resolved.fs.walk(&resolved.fs_path).await?;
        let files = entries.iter().filter(|(_, info)| !info.is_dir).count() as i32;
        let size: i64 = entries
            .iter()
            .filter(|(_, info)| !info.is_dir)
            .map(|(_, info)| info.size)
            .sum();
        self.provider
            .transactional_user_quota_update(&event.username, files, size, true)
            .await
    }

    async fn execute_folder_quota_reset(&self, event: &EventContext) -> Result<()> {
        if event.object_name.is_empty() {
            return Err(Error::Validation(
                "folder quota reset requires a folder name".to_string(),
            ));
        }
        self.provider
            .transactional_folder_quota_update(&event.object_name, 0, 0, true)
            .await
    }

    async fn execute_retention(
        &self,
        config: &RetentionActionConfig,
        event: &EventContext,
    ) -> Result<()> {
        let user = self.provider.get_effective_user(&event.username).await?;
        let vfs = VirtualFs::for_user(&user, &self.kms_handle())?;
        let now = util::now_ms();
        for folder in &config.folders {
            let base = util::clean_path(&folder.path);
            let cutoff = now - folder.retention_hours * 3600 * 1000;
            let resolved = vfs.resolve(&base);
            let entries = match resolved.fs.walk(&resolved.fs_path).await {
                Ok(entries) => entries,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let mut removed = 0usize;
            let mut dirs: Vec<String> = Vec::new();
            for (fs_path, info) in &entries {
                if info.is_dir {
                    dirs.push(fs_path.clone());
                    continue;
                }
                if info.modified_ms == 0 || info.modified_ms > cutoff {
                    continue;
                }
                let relative = fs_path
                    .strip_prefix(resolved.fs_path.as_str())
                    .unwrap_or(fs_path);
                let virtual_path = util::join_path(&base, relative.trim_start_matches('/'));
                if !folder.ignore_user_permissions {
                    if crate::policy::authorize_action(
                        &user,
                        Permission::DeleteFiles,
                        &virtual_path,
                    )
                    .is_err()
                    {
                        continue;
                    }
                }
                if resolved.fs.remove_file(fs_path).await.is_ok() {
                    removed += 1;
                }
            }
            if folder.delete_empty_dirs {
                // Deepest first so empty parents can go too.
                dirs.sort_by(|a, b| b.len().cmp(&a.len()));
                for dir in dirs {
                    let _ = resolved.fs.remove_dir(&dir).await;
                }
            }
            tracing::info!(
                user = %event.username,
                path = %base,
                removed,
                "data retention check completed"
            );
        }
        Ok(())
    }

    async fn execute_fs(&self, config: &FsActionConfig, event: &EventContext) -> Result<()> {
        let user = self.provider.get_effective_user(&event.username).await?;
        let vfs = VirtualFs::for_user(&user, &self.kms_handle())?;
        for rename in &config.renames {
            let source = replace_placeholders(&rename.key, event);
            let target = replace_placeholders(&rename.value, event);
            if util::clean_path(&source) == "/" {
                return Err(Error::Validation(
                    "the root path cannot be renamed".to_string(),
                ));
            }
            vfs.rename(&source, &target).await?;
        }
        for dir in &config.mkdirs {
            let dir = replace_placeholders(dir, event);
            let resolved = vfs.resolve(&dir);
            match resolved.fs.mkdir(&resolved.fs_path).await {
                Ok(()) | Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for path in &config.deletes {
            let path = replace_placeholders(path, event);
            let resolved = vfs.resolve(&path);
            match resolved.fs.remove_file(&resolved.fs_path).await {
                Ok(()) => {}
                // Deleting a missing file is not an error.
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for path in &config.exist {
            let path = replace_placeholders(path, event);
            let resolved = vfs.resolve(&path);
            resolved
                .fs
                .stat(&resolved.fs_path)
                .await
                .map_err(|_| Error::NotFound(format!("path {:?} does not exist", path)))?;
        }
        if let Some(compress) = &config.compress {
            self.execute_compress(&vfs, compress, event).await?;
        }
        Ok(())
    }

    async fn execute_compress(
        &self,
        vfs: &VirtualFs,
        compress: &FsCompress,
        event: &EventContext,
    ) -> Result<()> {
        let archive_path = replace_placeholders(&compress.name, event);
        let mut sources: HashMap<String, Vec<u8>> = HashMap::new();
        for path in &compress.paths {
            let path = replace_placeholders(path, event);
            let resolved = vfs.resolve(&path);
            let info = resolved.fs.stat(&resolved.fs_path).await?;
            if info.is_dir {
                for (child, child_info) in resolved.fs.walk(&resolved.fs_path).await? {
                    if child_info.is_dir {
                        continue;
                    }
                    let mut reader = resolved.fs.open_read(&child, 0).await?;
                    let mut data = Vec::new();
                    loop {
                        let chunk = reader.read_chunk(64 * 1024).await?;
                        if chunk.is_empty() {
                            break;
                        }
                        data.extend_from_slice(&chunk);
                    }
                    reader.close().await?;
                    sources.insert(child.trim_start_matches('/').to_string(), data);
                }
            } else {
                let mut reader = resolved.fs.open_read(&resolved.fs_path, 0).await?;
                let mut data = Vec::new();
                loop {
                    let chunk = reader.read_chunk(64 * 1024).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    data.extend_from_slice(&chunk);
                }
                reader.close().await?;
                sources.insert(util::base_name(&path), data);
            }
        }
        let archive = crate::zipstream::build_archive(sources)?;
        let resolved = vfs.resolve(&archive_path);
        let mut writer = resolved
            .fs
            .open_write(
                &resolved.fs_path,
                WriteFlags {
                    truncate: true,
                    ..Default::default()
                },
            )
            .await?;
        if let Err(e) = writer.write_chunk(&archive).await {
            let _ = writer.abort().await;
            return Err(e);
        }
        writer.close().await
    }

    async fn execute_password_expiration(
        &self,
        config: &PasswordExpirationConfig,
    ) -> Result<()> {
        // Expiring accounts; notification is delivered by a chained
        // email action, this records the hits.
        let threshold = util::now_ms() + config.threshold_days * 24 * 3600 * 1000;
        let users = self.provider.list_users(500, 0, true, None).await?;
        for user in users {
            if user.expiration_date > 0 && user.expiration_date < threshold {
                tracing::info!(
                    user = %user.username,
                    expires_at = user.expiration_date,
                    "account expires within the notification threshold"
                );
            }
        }
        Ok(())
    }

    fn kms_handle(&self) -> Arc<crate::kms::SecretBox> {
        self.provider.kms_arc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn upload_event() -> EventContext {
        let mut event = EventContext::fs("upload", "alice", "/in/report.pdf");
        event.kind = EventKind::Fs {
            event: "upload".to_string(),
        };
        event.file_size = 2048;
        event.protocol = "SSH".to_string();
        event.ip = "10.0.0.9".to_string();
        event
    }

    #[test]
    fn placeholder_substitution() {
        let event = upload_event();
        let out = replace_placeholders(
            "{{Event}} by {{Name}} on {{VirtualPath}} ({{FileSize}} bytes from {{IP}})",
            &event,
        );
        assert_eq!(out, "upload by alice on /in/report.pdf (2048 bytes from 10.0.0.9)");
        // No placeholders, no allocation churn path
        assert_eq!(replace_placeholders("static", &event), "static");
    }

    #[test]
    fn http_config_validation() {
        let mut config = HttpActionConfig {
            endpoint: "https://example.com/notify".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.method = "TRACE".to_string();
        assert!(config.validate().is_err());
        config.method = "POST".to_string();
        config.body = "x".to_string();
        config.parts = vec![HttpPart::default()];
        assert!(config.validate().is_err());
        config.endpoint = "not a url".to_string();
        config.parts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fs_action_rejects_root_rename() {
        let config = FsActionConfig {
            renames: vec![KeyValue {
                key: "/".to_string(),
                value: "/new".to_string(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn command_must_be_absolute() {
        let config = CommandActionConfig {
            cmd: "relative/script.sh".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn action_options_serde_roundtrip() {
        let action = EventAction {
            id: 0,
            name: "notify".to_string(),
            description: String::new(),
            options: EventActionOptions::Http(HttpActionConfig {
                endpoint: "https://example.com".to_string(),
                ..Default::default()
            }),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"http\""));
        let back: EventAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
        assert_eq!(back.type_id(), 1);

        let reset = EventAction {
            id: 0,
            name: "reset".to_string(),
            description: String::new(),
            options: EventActionOptions::UserQuotaReset,
        };
        let json = serde_json::to_string(&reset).unwrap();
        let back: EventAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_id(), 5);
    }
}
