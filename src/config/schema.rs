//! Typed views over Account, Identity and Context sections
//!
//! The on-disk text format keeps compound values as comma-joined lists and
//! `key:value` maps for backward compatibility; these views parse them
//! into real fields and serialize them back explicitly.

use secrecy::SecretString;
use serde::Serialize;
use serde_json::{Value, json};

use super::store::{
    ACCOUNT_PREFIX, CONTEXT_PREFIX, ConfigStore, ConfigValue, IDENTITY_PREFIX,
};
use crate::errors::AppResult;

/// Tags implied by a configured incoming mailbox
pub const ACCOUNT_TAGS: [&str; 3] = ["inbox", "spam", "trash"];
/// Tags implied by a configured outgoing route
pub const OUTGOING_TAGS: [&str; 2] = ["outbox", "sent"];

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn join_list(items: &[String]) -> String {
    items.join(", ")
}

/// One `Account N` section
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountInfo {
    #[serde(skip)]
    pub section: String,
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<String>,
    /// none, imap, imaps, files
    pub mailbox_proto: Option<String>,
    /// copy, move, read or sync
    pub mailbox_config: Option<String>,
    pub mailbox_server: Option<String>,
    pub mailbox_username: Option<String>,
    pub mailbox_inbox: Option<String>,
    pub mailbox_sent: Option<String>,
    pub mailbox_spam: Option<String>,
    pub mailbox_trash: Option<String>,
    /// none, smtp, proc
    pub sendmail_proto: Option<String>,
    pub sendmail_username: Option<String>,
}

impl AccountInfo {
    pub fn load(store: &ConfigStore, section: &str) -> AppResult<Self> {
        Ok(Self {
            section: section.to_owned(),
            name: store
                .get_text(section, "name")?
                .unwrap_or_else(|| section.to_owned()),
            description: store.get_text(section, "description")?,
            addresses: split_list(store.get_text(section, "addresses")?),
            mailbox_proto: store.get_text(section, "mailbox_proto")?,
            mailbox_config: store.get_text(section, "mailbox_config")?,
            mailbox_server: store.get_text(section, "mailbox_server")?,
            mailbox_username: store.get_text(section, "mailbox_username")?,
            mailbox_inbox: store.get_text(section, "mailbox_inbox")?,
            mailbox_sent: store.get_text(section, "mailbox_sent")?,
            mailbox_spam: store.get_text(section, "mailbox_spam")?,
            mailbox_trash: store.get_text(section, "mailbox_trash")?,
            sendmail_proto: store.get_text(section, "sendmail_proto")?,
            sendmail_username: store.get_text(section, "sendmail_username")?,
        })
    }

    /// The stored mailbox password, decrypted; `None` means prompt-on-demand
    ///
    /// Wrapped in a type that prevents accidental logging.
    pub fn mailbox_password(&self, store: &ConfigStore) -> AppResult<Option<SecretString>> {
        Ok(store
            .get(&self.section, "mailbox_password")?
            .and_then(|v| v.as_text().map(|t| SecretString::new(t.into()))))
    }

    /// The stored sendmail password; unset means reuse the mailbox one
    pub fn sendmail_password(&self, store: &ConfigStore) -> AppResult<Option<SecretString>> {
        Ok(store
            .get(&self.section, "sendmail_password")?
            .and_then(|v| v.as_text().map(|t| SecretString::new(t.into()))))
    }

    /// Tags this account contributes to its context
    pub fn tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        if self.mailbox_proto.is_some() && self.mailbox_config.is_some() {
            tags.extend(ACCOUNT_TAGS.iter().map(|t| (*t).to_owned()));
        }
        if self.sendmail_proto.is_some() {
            tags.extend(OUTGOING_TAGS.iter().map(|t| (*t).to_owned()));
        }
        tags
    }
}

/// One `Identity N` section
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityInfo {
    #[serde(skip)]
    pub section: String,
    pub name: String,
    pub address: String,
    pub signature: Option<String>,
}

impl IdentityInfo {
    pub fn load(store: &ConfigStore, section: &str) -> AppResult<Self> {
        Ok(Self {
            section: section.to_owned(),
            name: store
                .get_text(section, "name")?
                .unwrap_or_else(|| section.to_owned()),
            address: store.get_text(section, "address")?.unwrap_or_default(),
            signature: store.get_text(section, "signature")?,
        })
    }
}

/// One `Context N` section
#[derive(Debug, Clone, Default)]
pub struct ContextInfo {
    pub section: String,
    pub name: String,
    pub description: Option<String>,
    pub default_identity: Option<String>,
    pub tag_namespace: Option<String>,
    pub tag_required: bool,
    /// Identity section names
    pub identities: Vec<String>,
    /// Extra tags beyond the account-implied ones
    pub tags: Vec<String>,
    pub flags: Vec<String>,
    /// Account section names
    pub accounts: Vec<String>,
}

impl ContextInfo {
    pub fn load(store: &ConfigStore, section: &str) -> AppResult<Self> {
        let tag_required = store
            .get_text(section, "tag_required")?
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"));
        Ok(Self {
            section: section.to_owned(),
            name: store
                .get_text(section, "name")?
                .unwrap_or_else(|| section.to_owned()),
            description: store.get_text(section, "description")?,
            default_identity: store.get_text(section, "default_identity")?,
            tag_namespace: store.get_text(section, "tag_namespace")?,
            tag_required,
            identities: split_list(store.get_text(section, "identities")?),
            tags: split_list(store.get_text(section, "tags")?),
            flags: split_list(store.get_text(section, "flags")?),
            accounts: split_list(store.get_text(section, "accounts")?),
        })
    }

    /// Write the compound fields back in their text form
    pub fn save(&self, store: &mut ConfigStore) -> AppResult<()> {
        store.set(
            &self.section,
            "name",
            ConfigValue::Text(self.name.clone()),
        )?;
        for (option, items) in [
            ("identities", &self.identities),
            ("tags", &self.tags),
            ("flags", &self.flags),
            ("accounts", &self.accounts),
        ] {
            if items.is_empty() {
                store.delete(&self.section, option)?;
            } else {
                store.set(&self.section, option, ConfigValue::Text(join_list(items)))?;
            }
        }
        Ok(())
    }

    /// Every tag visible in this context (account-implied plus declared)
    pub fn all_tags(&self, store: &ConfigStore) -> AppResult<Vec<String>> {
        let mut tags = Vec::new();
        for account in &self.accounts {
            let info = AccountInfo::load(store, account)?;
            for tag in info.tags() {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        for tag in &self.tags {
            let tag = tag.to_lowercase();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    /// JSON shape served by the contexts RPC
    pub fn as_json(&self, store: &ConfigStore) -> AppResult<Value> {
        let mut accounts = serde_json::Map::new();
        for section in &self.accounts {
            accounts.insert(
                section.clone(),
                serde_json::to_value(AccountInfo::load(store, section)?)?,
            );
        }
        let mut identities = serde_json::Map::new();
        for section in &self.identities {
            identities.insert(
                section.clone(),
                serde_json::to_value(IdentityInfo::load(store, section)?)?,
            );
        }
        Ok(json!({
            "key": self.section,
            "name": self.name,
            "description": self.description,
            "accounts": accounts,
            "identities": identities,
            "tags": self.all_tags(store)?,
        }))
    }
}

impl ConfigStore {
    pub fn accounts(&self) -> AppResult<Vec<AccountInfo>> {
        self.prefixed(ACCOUNT_PREFIX, AccountInfo::load)
    }

    pub fn identities(&self) -> AppResult<Vec<IdentityInfo>> {
        self.prefixed(IDENTITY_PREFIX, IdentityInfo::load)
    }

    pub fn contexts(&self) -> AppResult<Vec<ContextInfo>> {
        self.prefixed(CONTEXT_PREFIX, ContextInfo::load)
    }

    /// Find a context by section name or display name
    pub fn find_context(&self, name: &str) -> AppResult<Option<ContextInfo>> {
        for ctx in self.contexts()? {
            if ctx.section == name || ctx.name == name {
                return Ok(Some(ctx));
            }
        }
        Ok(None)
    }

    fn prefixed<T>(
        &self,
        prefix: &str,
        load: impl Fn(&ConfigStore, &str) -> AppResult<T>,
    ) -> AppResult<Vec<T>> {
        let mut out = Vec::new();
        for section in self.section_names() {
            if section.starts_with(prefix) {
                out.push(load(self, &section)?);
            }
        }
        Ok(out)
    }
}
