//! The account store: names, certificates and salted password hashes,
//! persisted as a small XML file.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{info, warn};
use weft::XmlElement;
use weft_acl::AccountId;

/// Salt and digest of one password.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PasswordHash {
    salt: [u8; 32],
    hash: [u8; 32],
}

impl PasswordHash {
    /// Hashes `password` under a fresh random salt.
    pub fn generate(password: &str) -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = digest(&salt, password);
        Self { salt, hash }
    }

    /// Constant-time password check.
    pub fn verify(&self, password: &str) -> bool {
        let candidate = digest(&self.salt, password);
        let mut diff = 0u8;
        for (a, b) in candidate.iter().zip(self.hash.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

/// The digest is taken over the first half of the salt, the password
/// bytes, then the second half of the salt.
fn digest(salt: &[u8; 32], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&salt[..16]);
    hasher.update(password.as_bytes());
    hasher.update(&salt[16..]);
    hasher.finalize().into()
}

/// One account known to the server.
#[derive(Clone, Debug)]
pub struct Account {
    /// Stable string id.
    pub id: AccountId,
    /// Human-readable name.
    pub name: String,
    /// Certificate fingerprints this account logs in with.
    pub certificates: Vec<String>,
    /// Password credential, if any.
    pub password: Option<PasswordHash>,
    /// First login.
    pub first_seen: DateTime<Utc>,
    /// Most recent login.
    pub last_seen: DateTime<Utc>,
}

/// All accounts, indexed by id, with XML persistence.
pub struct AccountStore {
    accounts: FnvHashMap<AccountId, Account>,
    path: Option<PathBuf>,
}

impl AccountStore {
    /// Returns an empty, unpersisted store.
    pub fn in_memory() -> Self {
        Self {
            accounts: FnvHashMap::default(),
            path: None,
        }
    }

    /// Opens the store at `path`, creating it lazily on first save.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut store = Self {
            accounts: FnvHashMap::default(),
            path: Some(path.clone()),
        };
        if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            store.load(&bytes)?;
            info!(count = store.accounts.len(), "loaded account store");
        }
        Ok(store)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let root = XmlElement::parse(bytes)
            .map_err(|err| anyhow::anyhow!("parsing account list: {}", err))?;
        for element in root.children() {
            if element.name() != "account" {
                warn!(tag = element.name(), "skipping unknown account entry");
                continue;
            }
            match account_from_xml(element) {
                Ok(account) => {
                    self.accounts.insert(account.id.clone(), account);
                }
                Err(err) => warn!(%err, "skipping malformed account"),
            }
        }
        Ok(())
    }

    /// Writes the store back to disk, if it is file-backed.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut root = XmlElement::new("account-list");
        for account in self.accounts.values() {
            root = root.with_child(account_to_xml(account));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, root.to_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// The account with `id`.
    pub fn get(&self, id: &AccountId) -> Option<&Account> {
        self.accounts.get(id)
    }

    /// Iterates all accounts.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// The number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Finds the account bound to a certificate fingerprint.
    pub fn by_certificate(&self, fingerprint: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.certificates.iter().any(|c| c == fingerprint))
    }

    /// Finds an account by display name.
    pub fn by_name(&self, name: &str) -> Option<&Account> {
        self.accounts.values().find(|a| a.name == name)
    }

    /// Checks `name`/`password` and stamps `last_seen` on success.
    pub fn authenticate(&mut self, name: &str, password: &str) -> Option<AccountId> {
        let id = self
            .accounts
            .values()
            .find(|a| {
                a.name == name
                    && a.password
                        .as_ref()
                        .is_some_and(|hash| hash.verify(password))
            })
            .map(|a| a.id.clone())?;
        if let Some(account) = self.accounts.get_mut(&id) {
            account.last_seen = Utc::now();
        }
        Some(id)
    }

    /// Creates an account named `name`. The id is derived from the name
    /// and must be free.
    pub fn create(
        &mut self,
        name: &str,
        password: Option<&str>,
        certificate: Option<String>,
    ) -> Result<AccountId> {
        let id = AccountId::from(format!("user:{}", name));
        anyhow::ensure!(
            !self.accounts.contains_key(&id),
            "account {} already exists",
            id
        );
        let now = Utc::now();
        self.accounts.insert(
            id.clone(),
            Account {
                id: id.clone(),
                name: name.to_owned(),
                certificates: certificate.into_iter().collect(),
                password: password.map(PasswordHash::generate),
                first_seen: now,
                last_seen: now,
            },
        );
        Ok(id)
    }

    /// Removes an account.
    pub fn remove(&mut self, id: &AccountId) -> bool {
        self.accounts.remove(id).is_some()
    }

    /// Replaces the certificate binding of an account.
    pub fn override_certificates(&mut self, id: &AccountId, certificates: Vec<String>) -> bool {
        match self.accounts.get_mut(id) {
            Some(account) => {
                account.certificates = certificates;
                true
            }
            None => false,
        }
    }
}

fn account_to_xml(account: &Account) -> XmlElement {
    let mut element = XmlElement::new("account")
        .with_attr("id", account.id.as_str())
        .with_attr("name", account.name.clone())
        .with_attr("first-seen", account.first_seen.to_rfc3339())
        .with_attr("last-seen", account.last_seen.to_rfc3339());
    if let Some(password) = &account.password {
        element = element
            .with_attr("password-salt", hex::encode(password.salt))
            .with_attr("password-hash", hex::encode(password.hash));
    }
    for certificate in &account.certificates {
        element = element.with_child(
            XmlElement::new("certificate").with_text(certificate.clone()),
        );
    }
    element
}

fn account_from_xml(element: &XmlElement) -> Result<Account> {
    let id = AccountId::from(
        element
            .attr("id")
            .context("account entry is missing its id")?,
    );
    let name = element
        .attr("name")
        .context("account entry is missing its name")?
        .to_owned();
    let password = match (element.attr("password-salt"), element.attr("password-hash")) {
        (Some(salt), Some(hash)) => {
            let salt: [u8; 32] = hex::decode(salt)
                .context("decoding password salt")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("password salt must be 32 bytes"))?;
            let hash: [u8; 32] = hex::decode(hash)
                .context("decoding password hash")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("password hash must be 32 bytes"))?;
            Some(PasswordHash { salt, hash })
        }
        _ => None,
    };
    let first_seen = parse_stamp(element.attr("first-seen"))?;
    let last_seen = parse_stamp(element.attr("last-seen"))?;
    let certificates = element
        .children()
        .iter()
        .filter(|c| c.name() == "certificate")
        .map(|c| c.text().to_owned())
        .collect();
    Ok(Account {
        id,
        name,
        certificates,
        password,
        first_seen,
        last_seen,
    })
}

fn parse_stamp(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        None => Ok(Utc::now()),
        Some(value) => Ok(DateTime::parse_from_rfc3339(value)
            .with_context(|| format!("parsing timestamp {:?}", value))?
            .with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_verification_accepts_only_the_right_password() {
        let hash = PasswordHash::generate("hunter2");
        assert!(hash.verify("hunter2"));
        assert!(!hash.verify("hunter3"));
        assert!(!hash.verify(""));
    }

    #[test]
    fn authenticate_finds_account_and_stamps_last_seen() {
        let mut store = AccountStore::in_memory();
        let id = store.create("alice", Some("secret"), None).unwrap();
        let before = store.get(&id).unwrap().last_seen;
        assert_eq!(store.authenticate("alice", "secret"), Some(id.clone()));
        assert!(store.get(&id).unwrap().last_seen >= before);
        assert_eq!(store.authenticate("alice", "wrong"), None);
        assert_eq!(store.authenticate("nobody", "secret"), None);
    }

    #[test]
    fn duplicate_account_names_are_rejected() {
        let mut store = AccountStore::in_memory();
        store.create("alice", None, None).unwrap();
        assert!(store.create("alice", None, None).is_err());
    }

    #[test]
    fn certificate_lookup_matches_fingerprints() {
        let mut store = AccountStore::in_memory();
        let id = store
            .create("bob", None, Some("ab:cd:ef".into()))
            .unwrap();
        assert_eq!(store.by_certificate("ab:cd:ef").map(|a| a.id.clone()), Some(id));
        assert!(store.by_certificate("00:00:00").is_none());
    }

    #[test]
    fn store_roundtrips_through_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.xml");
        {
            let mut store = AccountStore::open(path.clone()).unwrap();
            store.create("alice", Some("pw"), None).unwrap();
            store
                .create("bob", None, Some("fingerprint".into()))
                .unwrap();
            store.save().unwrap();
        }
        let mut reloaded = AccountStore::open(path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.authenticate("alice", "pw").is_some());
        assert!(reloaded.by_certificate("fingerprint").is_some());
    }
}
