//! Filesystem persistence: one file per document under the root
//! directory, written and read through the session's sync serialisation.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use weft::{
    user_to_xml, ConnectionId, Outbound, Session, SessionDocument, SessionStatus, TextSession,
    XmlElement,
};

/// The account file kept next to the document tree.
pub const ACCOUNTS_FILE: &str = "accounts.xml";

/// Document storage rooted at one directory; subdirectories of the node
/// tree map to filesystem directories.
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Opens (and creates) the storage root.
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating storage root {}", root.display()))?;
        Ok(Self { root })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the account store file.
    pub fn accounts_path(&self) -> PathBuf {
        self.root.join(ACCOUNTS_FILE)
    }

    fn document_file(&self, node_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in node_path.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Writes a document session to its file as a serialised sync stream.
    pub fn save_document(&self, node_path: &str, session: &Session<TextSession>) -> Result<()> {
        let file = self.document_file(node_path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut root = XmlElement::new("document");
        for user in session.users().iter() {
            root = root.with_child(user_to_xml("sync-user", user));
        }
        for item in session.doc().sync_items() {
            root = root.with_child(item);
        }
        std::fs::write(&file, root.to_bytes())
            .with_context(|| format!("writing {}", file.display()))?;
        debug!(path = %file.display(), "document saved");
        Ok(())
    }

    /// Loads a document session by replaying its serialised sync stream,
    /// then promotes the replica to host.
    pub fn load_document(&self, node_path: &str) -> Result<Session<TextSession>> {
        let file = self.document_file(node_path);
        let bytes = std::fs::read(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        let root = XmlElement::parse(&bytes)
            .map_err(|err| anyhow::anyhow!("parsing {}: {}", file.display(), err))?;
        let mut session = Session::new_joined(TextSession::new());
        let source = ConnectionId(0);
        session
            .synchronize_from(source)
            .map_err(|err| anyhow::anyhow!("starting restore: {}", err))?;
        let feed = |session: &mut Session<TextSession>, element: &XmlElement| {
            session
                .handle_element(source, element)
                .map_err(|err| anyhow::anyhow!("restoring {}: {}", file.display(), err))
        };
        feed(
            &mut session,
            &XmlElement::new("sync-begin").with_attr("n", root.children().len()),
        )?;
        for child in root.children() {
            feed(&mut session, child)?;
        }
        feed(&mut session, &XmlElement::new("sync-end"))?;
        anyhow::ensure!(
            session.status() == SessionStatus::Running,
            "restore of {} did not complete",
            file.display()
        );
        // Swallow the sync-ack the replica queued for its fake source.
        let _: Vec<Outbound> = session.drain_outbox();
        session.promote_to_host();
        Ok(session)
    }

    /// Writes a plain-text copy of a document under `target`, used by the
    /// sync-directory exporter.
    pub fn export_plaintext(
        &self,
        target: &Path,
        node_path: &str,
        session: &Session<TextSession>,
    ) -> Result<()> {
        let mut file = target.to_path_buf();
        for part in node_path.split('/').filter(|p| !p.is_empty()) {
            file.push(part);
        }
        file.set_extension("txt");
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&file, session.doc().text())
            .with_context(|| format!("writing {}", file.display()))?;
        Ok(())
    }

    /// Enumerates stored documents and subdirectories beneath `node_path`,
    /// returning `(name, is_directory)` pairs. The account file does not
    /// count.
    pub fn list(&self, node_path: &str) -> Result<Vec<(String, bool)>> {
        let dir = self.document_file(node_path);
        let mut entries = Vec::new();
        if !dir.exists() {
            return Ok(entries);
        }
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if node_path.is_empty() && name == ACCOUNTS_FILE {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            entries.push((name, is_dir));
        }
        entries.sort();
        Ok(entries)
    }

    /// Removes a document file or subdirectory tree.
    pub fn remove(&self, node_path: &str, is_directory: bool) -> Result<()> {
        let path = self.document_file(node_path);
        if !path.exists() {
            return Ok(());
        }
        let result = if is_directory {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = result {
            warn!(path = %path.display(), %err, "failed to remove stored node");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft::JoinParams;
    use weft_ot::UserId;

    fn session_with_text(text: &str) -> (Session<TextSession>, UserId) {
        let mut session = Session::new_host(TextSession::new());
        let user = session
            .join_user(
                JoinParams {
                    name: "author".into(),
                    ..JoinParams::default()
                },
                None,
            )
            .unwrap()
            .unwrap();
        session.doc_mut().algorithm_mut().add_user(user);
        session.insert_text(user, 0, text).unwrap();
        session.drain_outbox();
        (session, user)
    }

    #[test]
    fn documents_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let (session, user) = session_with_text("persisted content");
        storage.save_document("/notes/today", &session).unwrap();

        let loaded = storage.load_document("/notes/today").unwrap();
        assert_eq!(loaded.doc().text(), "persisted content");
        // History survives: the author can still undo after a reload.
        assert!(loaded.doc().algorithm().can_undo(user));
        assert_eq!(
            loaded.users().by_name("author").map(|u| u.id),
            Some(user)
        );
    }

    #[test]
    fn listing_skips_the_account_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        std::fs::write(storage.accounts_path(), b"<account-list/>").unwrap();
        let (session, _) = session_with_text("x");
        storage.save_document("/doc", &session).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let entries = storage.list("").unwrap();
        assert_eq!(
            entries,
            vec![("doc".to_string(), false), ("sub".to_string(), true)]
        );
    }

    #[test]
    fn plaintext_export_writes_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let (session, _) = session_with_text("export me");
        storage
            .export_plaintext(out.path(), "/a/b", &session)
            .unwrap();
        let content = std::fs::read_to_string(out.path().join("a/b.txt")).unwrap();
        assert_eq!(content, "export me");
    }
}
