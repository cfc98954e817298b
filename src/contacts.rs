use crate::storage::{self, KEY_CONTACTS, SharedStore};
use crate::stream::now_millis;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    pub relationship: Option<String>,
}

/// Fields to change; `None` keeps the current value. An empty relationship
/// clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContactError {
    #[error("Name and phone number are required for emergency contacts")]
    MissingRequired,
    #[error("no emergency contact with id '{0}'")]
    NotFound(String),
}

pub struct ContactBook {
    store: SharedStore,
    contacts: Vec<EmergencyContact>,
    last_id: u64,
}

impl ContactBook {
    pub fn load(store: SharedStore) -> Self {
        let contacts: Vec<EmergencyContact> = storage::load_or_default(&*store, KEY_CONTACTS);
        let last_id = contacts
            .iter()
            .filter_map(|contact| contact.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Self {
            store,
            contacts,
            last_id,
        }
    }

    pub fn contacts(&self) -> &[EmergencyContact] {
        &self.contacts
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&EmergencyContact> {
        self.contacts.iter().find(|contact| contact.id == id)
    }

    /// Looks a contact up by id, then by case-insensitive name.
    pub fn find(&self, id_or_name: &str) -> Option<&EmergencyContact> {
        self.get(id_or_name).or_else(|| {
            self.contacts
                .iter()
                .find(|contact| contact.name.eq_ignore_ascii_case(id_or_name.trim()))
        })
    }

    pub fn add(&mut self, new: NewContact) -> Result<EmergencyContact> {
        let name = new.name.trim();
        let phone = new.phone.trim();
        if name.is_empty() || phone.is_empty() {
            return Err(ContactError::MissingRequired.into());
        }

        let contact = EmergencyContact {
            id: self.next_id(),
            name: name.to_owned(),
            phone: phone.to_owned(),
            relationship: normalize_relationship(new.relationship),
        };
        self.contacts.push(contact.clone());
        self.persist()?;
        info!(id = %contact.id, "added emergency contact: {}", contact.name);
        Ok(contact)
    }

    pub fn update(&mut self, id: &str, patch: ContactPatch) -> Result<EmergencyContact> {
        let contact = self
            .contacts
            .iter_mut()
            .find(|contact| contact.id == id)
            .ok_or_else(|| ContactError::NotFound(id.to_owned()))?;

        let name = patch.name.as_deref().map(str::trim).unwrap_or(&contact.name);
        let phone = patch.phone.as_deref().map(str::trim).unwrap_or(&contact.phone);
        if name.is_empty() || phone.is_empty() {
            return Err(ContactError::MissingRequired.into());
        }
        let (name, phone) = (name.to_owned(), phone.to_owned());

        contact.name = name;
        contact.phone = phone;
        if patch.relationship.is_some() {
            contact.relationship = normalize_relationship(patch.relationship);
        }
        let updated = contact.clone();
        self.persist()?;
        info!(id = %updated.id, "updated emergency contact: {}", updated.name);
        Ok(updated)
    }

    pub fn remove(&mut self, id: &str) -> Result<EmergencyContact> {
        let pos = self
            .contacts
            .iter()
            .position(|contact| contact.id == id)
            .ok_or_else(|| ContactError::NotFound(id.to_owned()))?;
        let removed = self.contacts.remove(pos);
        self.persist()?;
        info!(id = %removed.id, "removed emergency contact: {}", removed.name);
        Ok(removed)
    }

    fn next_id(&mut self) -> String {
        let id = now_millis().max(self.last_id + 1);
        self.last_id = id;
        id.to_string()
    }

    fn persist(&self) -> Result<()> {
        storage::save(&*self.store, KEY_CONTACTS, &self.contacts)
    }
}

fn normalize_relationship(relationship: Option<String>) -> Option<String> {
    relationship
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{ContactBook, ContactError, ContactPatch, NewContact};
    use crate::storage::{MemoryStore, SharedStore};
    use std::sync::Arc;

    fn store() -> SharedStore {
        Arc::new(MemoryStore::new())
    }

    fn alice() -> NewContact {
        NewContact {
            name: "Alice Rao".to_owned(),
            phone: "+91 98450 00000".to_owned(),
            relationship: Some("Team lead".to_owned()),
        }
    }

    #[test]
    fn contacts_persist_across_loads() {
        let store = store();
        let mut book = ContactBook::load(store.clone());
        let added = book.add(alice()).unwrap();
        book.add(NewContact {
            name: "Base camp".to_owned(),
            phone: "+1 555 0100".to_owned(),
            relationship: None,
        })
        .unwrap();

        let reloaded = ContactBook::load(store);
        assert_eq!(reloaded.contacts().len(), 2);
        assert_eq!(reloaded.get(&added.id), Some(&added));
        assert_eq!(reloaded.find("base CAMP").unwrap().relationship, None);
    }

    #[test]
    fn name_and_phone_are_required() {
        let mut book = ContactBook::load(store());
        let err = book
            .add(NewContact {
                name: "  ".to_owned(),
                phone: "+1".to_owned(),
                relationship: None,
            })
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ContactError>(),
            Some(&ContactError::MissingRequired)
        );
        assert!(book.is_empty());
    }

    #[test]
    fn update_merges_and_validates() {
        let mut book = ContactBook::load(store());
        let added = book.add(alice()).unwrap();

        let updated = book
            .update(
                &added.id,
                ContactPatch {
                    phone: Some("+91 80 0000 0000".to_owned()),
                    relationship: Some(String::new()),
                    ..ContactPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Alice Rao");
        assert_eq!(updated.phone, "+91 80 0000 0000");
        assert_eq!(updated.relationship, None);

        assert!(
            book.update(
                &added.id,
                ContactPatch {
                    name: Some(String::new()),
                    ..ContactPatch::default()
                }
            )
            .is_err()
        );
        assert_eq!(book.get(&added.id).unwrap().name, "Alice Rao");
    }

    #[test]
    fn remove_unknown_id_fails() {
        let mut book = ContactBook::load(store());
        let added = book.add(alice()).unwrap();
        assert!(book.remove("nope").is_err());
        assert_eq!(book.remove(&added.id).unwrap().name, "Alice Rao");
        assert!(book.is_empty());
    }
}
