//! Maildir driver.
//!
//! Serves read-only queries over a Maildir++ tree: the root is `INBOX`,
//! subfolders are `.Name` directories next to it. A folder is any directory
//! holding a `cur` subdirectory.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mailfw_runtime::{Fault, Serve};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Name under which the Maildir root is exposed.
pub const INBOX: &str = "INBOX";

/// Commands understood by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MaildirCommand {
    ListFolders,
    CountMessages { folder: String },
}

/// Driver replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaildirReply {
    Folders(Vec<String>),
    Count(usize),
}

/// Driver failures.
#[derive(Debug, thiserror::Error)]
pub enum MaildirError {
    #[error("Folder not found: {0}")]
    NotFound(String),

    #[error("Invalid folder name: {0}")]
    InvalidName(String),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Fault for MaildirError {
    fn category(&self) -> Cow<'_, str> {
        match self {
            MaildirError::NotFound(_) => Cow::Borrowed("not_found"),
            MaildirError::InvalidName(_) => Cow::Borrowed("invalid_name"),
            MaildirError::Io { .. } => Cow::Borrowed("io"),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MaildirError + '_ {
    move |source| MaildirError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Driver over one Maildir tree.
#[derive(Debug, Clone)]
pub struct MaildirDriver {
    root: PathBuf,
}

impl MaildirDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf, MaildirError> {
        if folder == INBOX {
            return Ok(self.root.clone());
        }
        if folder.is_empty()
            || folder.starts_with('.')
            || folder.contains('/')
            || folder.contains('\\')
            || folder.contains("..")
        {
            return Err(MaildirError::InvalidName(folder.to_string()));
        }
        Ok(self.root.join(format!(".{folder}")))
    }

    async fn list_folders(&self) -> Result<Vec<String>, MaildirError> {
        let mut subfolders = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(io_error(&self.root))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.root))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(folder) = name.strip_prefix('.') else {
                continue;
            };
            if !folder.is_empty() && is_dir(&entry.path().join("cur")).await {
                subfolders.push(folder.to_string());
            }
        }
        subfolders.sort();

        let mut folders = Vec::with_capacity(subfolders.len() + 1);
        if is_dir(&self.root.join("cur")).await {
            folders.push(INBOX.to_string());
        }
        folders.extend(subfolders);
        Ok(folders)
    }

    async fn count_messages(&self, folder: &str) -> Result<usize, MaildirError> {
        let path = self.folder_path(folder)?;
        if !is_dir(&path.join("cur")).await {
            return Err(MaildirError::NotFound(folder.to_string()));
        }

        let mut count = 0;
        for sub in ["cur", "new"] {
            let dir = path.join(sub);
            if !is_dir(&dir).await {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await.map_err(io_error(&dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let file_type = entry.file_type().await.map_err(io_error(&dir))?;
                if file_type.is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

#[async_trait]
impl Serve for MaildirDriver {
    type Command = MaildirCommand;
    type Reply = MaildirReply;
    type Error = MaildirError;

    async fn serve(&mut self, command: MaildirCommand) -> Result<MaildirReply, MaildirError> {
        tracing::debug!(?command, "Serving");
        match command {
            MaildirCommand::ListFolders => self.list_folders().await.map(MaildirReply::Folders),
            MaildirCommand::CountMessages { folder } => {
                self.count_messages(&folder).await.map(MaildirReply::Count)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// INBOX with 2 messages, `.Archive` with 1, `.Drafts` empty, plus noise.
    pub(crate) async fn create_test_maildir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        for folder in ["", ".Archive", ".Drafts"] {
            for sub in ["cur", "new", "tmp"] {
                fs::create_dir_all(root.join(folder).join(sub)).await.unwrap();
            }
        }
        fs::write(root.join("cur/1.host:2,S"), "Subject: one\n\n").await.unwrap();
        fs::write(root.join("new/2.host"), "Subject: two\n\n").await.unwrap();
        fs::write(root.join(".Archive/cur/3.host:2,S"), "Subject: three\n\n")
            .await
            .unwrap();
        fs::write(root.join("dovecot-uidlist"), "").await.unwrap();
        fs::create_dir(root.join(".NotAFolder")).await.unwrap();

        dir
    }

    #[tokio::test]
    async fn test_list_folders() {
        let dir = create_test_maildir().await;
        let mut driver = MaildirDriver::new(dir.path());

        let reply = driver.serve(MaildirCommand::ListFolders).await.unwrap();
        assert_eq!(
            reply,
            MaildirReply::Folders(vec![
                "INBOX".to_string(),
                "Archive".to_string(),
                "Drafts".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_count_messages() {
        let dir = create_test_maildir().await;
        let mut driver = MaildirDriver::new(dir.path());

        let count = |folder: &str| MaildirCommand::CountMessages {
            folder: folder.to_string(),
        };
        assert_eq!(driver.serve(count("INBOX")).await.unwrap(), MaildirReply::Count(2));
        assert_eq!(driver.serve(count("Archive")).await.unwrap(), MaildirReply::Count(1));
        assert_eq!(driver.serve(count("Drafts")).await.unwrap(), MaildirReply::Count(0));
    }

    #[tokio::test]
    async fn test_errors_carry_categories() {
        let dir = create_test_maildir().await;
        let mut driver = MaildirDriver::new(dir.path());

        let err = driver
            .serve(MaildirCommand::CountMessages {
                folder: "Spam".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), "not_found");

        let err = driver
            .serve(MaildirCommand::CountMessages {
                folder: "../etc".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), "invalid_name");

        // A leading dot would climb out of the root once prefixed.
        for folder in [".", ".x", "..."] {
            let err = driver
                .serve(MaildirCommand::CountMessages {
                    folder: folder.to_string(),
                })
                .await
                .unwrap_err();
            assert_eq!(err.category(), "invalid_name", "folder {folder:?}");
        }

        let mut missing = MaildirDriver::new(dir.path().join("absent"));
        let err = missing.serve(MaildirCommand::ListFolders).await.unwrap_err();
        assert_eq!(err.category(), "io");
    }

    #[tokio::test]
    async fn test_dot_folder_stays_inside_root() {
        let outer = TempDir::new().unwrap();
        fs::create_dir_all(outer.path().join("cur")).await.unwrap();
        fs::write(outer.path().join("cur/secret"), "outside").await.unwrap();
        let root = outer.path().join("Maildir");
        fs::create_dir_all(root.join("cur")).await.unwrap();

        let mut driver = MaildirDriver::new(&root);
        let err = driver
            .serve(MaildirCommand::CountMessages {
                folder: ".".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MaildirError::InvalidName(_)));
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_string(&MaildirCommand::CountMessages {
            folder: "Archive".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"count_messages","folder":"Archive"}"#);
    }
}
