//! Protocol, login-method and permission vocabulary
//!
//! These enums are the contract between the provider, the policy engine and
//! the HTTP layer. Their serialized names are wire-stable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocols a principal can connect with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "SSH")]
    Ssh,
    #[serde(rename = "FTP")]
    Ftp,
    #[serde(rename = "DAV")]
    Dav,
    #[serde(rename = "HTTP")]
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "SSH",
            Protocol::Ftp => "FTP",
            Protocol::Dav => "DAV",
            Protocol::Http => "HTTP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SSH" | "SFTP" => Some(Protocol::Ssh),
            "FTP" => Some(Protocol::Ftp),
            "DAV" | "WebDAV" => Some(Protocol::Dav),
            "HTTP" => Some(Protocol::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a principal authenticated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LoginMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
    #[serde(rename = "publickey+password")]
    KeyAndPassword,
    #[serde(rename = "TLSCertificate")]
    TlsCertificate,
    #[serde(rename = "TLSCertificate+password")]
    TlsCertificateAndPassword,
    #[serde(rename = "IDP")]
    IdentityProvider,
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoginMethod::Password => "password",
            LoginMethod::PublicKey => "publickey",
            LoginMethod::KeyboardInteractive => "keyboard-interactive",
            LoginMethod::KeyAndPassword => "publickey+password",
            LoginMethod::TlsCertificate => "TLSCertificate",
            LoginMethod::TlsCertificateAndPassword => "TLSCertificate+password",
            LoginMethod::IdentityProvider => "IDP",
        };
        f.write_str(s)
    }
}

/// Filesystem permission verbs, path-scoped per user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Permission {
    #[serde(rename = "*")]
    Any,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "overwrite")]
    Overwrite,
    #[serde(rename = "delete_files")]
    DeleteFiles,
    #[serde(rename = "delete_dirs")]
    DeleteDirs,
    #[serde(rename = "rename_files")]
    RenameFiles,
    #[serde(rename = "rename_dirs")]
    RenameDirs,
    #[serde(rename = "create_dirs")]
    CreateDirs,
    #[serde(rename = "create_symlinks")]
    CreateSymlinks,
    #[serde(rename = "chmod")]
    Chmod,
    #[serde(rename = "chown")]
    Chown,
    #[serde(rename = "chtimes")]
    Chtimes,
}

impl Permission {
    /// All concrete verbs, excluding the `*` wildcard.
    pub const ALL: [Permission; 13] = [
        Permission::List,
        Permission::Download,
        Permission::Upload,
        Permission::Overwrite,
        Permission::DeleteFiles,
        Permission::DeleteDirs,
        Permission::RenameFiles,
        Permission::RenameDirs,
        Permission::CreateDirs,
        Permission::CreateSymlinks,
        Permission::Chmod,
        Permission::Chown,
        Permission::Chtimes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Any => "*",
            Permission::List => "list",
            Permission::Download => "download",
            Permission::Upload => "upload",
            Permission::Overwrite => "overwrite",
            Permission::DeleteFiles => "delete_files",
            Permission::DeleteDirs => "delete_dirs",
            Permission::RenameFiles => "rename_files",
            Permission::RenameDirs => "rename_dirs",
            Permission::CreateDirs => "create_dirs",
            Permission::CreateSymlinks => "create_symlinks",
            Permission::Chmod => "chmod",
            Permission::Chown => "chown",
            Permission::Chtimes => "chtimes",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_wire_names() {
        let p: Permission = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(p, Permission::Any);
        let p: Permission = serde_json::from_str("\"delete_dirs\"").unwrap();
        assert_eq!(p, Permission::DeleteDirs);
        assert_eq!(serde_json::to_string(&Permission::Chtimes).unwrap(), "\"chtimes\"");
    }

    #[test]
    fn protocol_parse_accepts_aliases() {
        assert_eq!(Protocol::parse("SFTP"), Some(Protocol::Ssh));
        assert_eq!(Protocol::parse("WebDAV"), Some(Protocol::Dav));
        assert_eq!(Protocol::parse("gopher"), None);
    }
}
