use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info};

use pairline_db::Database;
use pairline_types::api::DirectoryEntry;
use pairline_types::events::GatewayEvent;
use pairline_types::models::User;
use pairline_types::{ChatError, Result, validate_user_id};

/// Known users plus who is currently connected.
///
/// Entries are written by the identity edge (every sign-in upserts the user)
/// and read to populate "who can I message". Presence is connection-counted:
/// a user stays online while any of their gateway connections is open.
#[derive(Clone)]
pub struct Directory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    db: Arc<Database>,
    online: RwLock<HashMap<String, usize>>,
    presence_tx: broadcast::Sender<GatewayEvent>,
}

impl Directory {
    pub fn new(db: Arc<Database>) -> Self {
        let (presence_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(DirectoryInner {
                db,
                online: RwLock::new(HashMap::new()),
                presence_tx,
            }),
        }
    }

    /// Upsert a user. A missing label keeps whatever was stored before.
    pub fn register(&self, user: &User) -> Result<()> {
        validate_user_id(&user.id)?;
        self.inner
            .db
            .upsert_user(&user.id, user.display_label.as_deref())
            .map_err(ChatError::unavailable)?;
        debug!("Directory upsert for {}", user.id);
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<User>> {
        let row = self.inner.db.get_user(user_id).map_err(ChatError::unavailable)?;
        Ok(row.map(|row| User {
            id: row.id,
            display_label: row.display_label,
        }))
    }

    pub fn users(&self) -> Result<Vec<User>> {
        let rows = self.inner.db.list_users().map_err(ChatError::unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| User {
                id: row.id,
                display_label: row.display_label,
            })
            .collect())
    }

    /// Everyone `current_user` can open a channel with, with online flags.
    pub fn contacts(&self, current_user: &str) -> Result<Vec<DirectoryEntry>> {
        let online = self.inner.online.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .users()?
            .into_iter()
            .filter(|user| user.id != current_user)
            .map(|user| DirectoryEntry {
                online: online.contains_key(&user.id),
                user_id: user.id,
                display_label: user.display_label,
            })
            .collect())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(user_id)
    }

    /// Users with at least one open connection.
    pub fn online_users(&self) -> Vec<String> {
        self.inner
            .online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Count a new connection. Broadcasts presence on the first one.
    pub fn user_online(&self, user_id: &str, display_label: Option<String>) {
        let first = {
            let mut online = self.inner.online.write().unwrap_or_else(PoisonError::into_inner);
            let count = online.entry(user_id.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            info!("{} is online", user_id);
            let _ = self.inner.presence_tx.send(GatewayEvent::PresenceUpdate {
                user_id: user_id.to_string(),
                display_label,
                online: true,
            });
        }
    }

    /// Release a connection. Broadcasts presence when the last one closes.
    pub fn user_offline(&self, user_id: &str) {
        let last = {
            let mut online = self.inner.online.write().unwrap_or_else(PoisonError::into_inner);
            match online.get_mut(user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    online.remove(user_id);
                    true
                }
                None => false,
            }
        };

        if last {
            info!("{} is offline", user_id);
            let display_label = self.get(user_id).ok().flatten().and_then(|u| u.display_label);
            let _ = self.inner.presence_tx.send(GatewayEvent::PresenceUpdate {
                user_id: user_id.to_string(),
                display_label,
                online: false,
            });
        }
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.presence_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn user(id: &str, label: Option<&str>) -> User {
        User {
            id: id.into(),
            display_label: label.map(Into::into),
        }
    }

    #[test]
    fn contacts_exclude_caller() {
        let directory = directory();
        directory.register(&user("u1", Some("one@example.com"))).unwrap();
        directory.register(&user("u2", Some("two@example.com"))).unwrap();
        directory.register(&user("u3", None)).unwrap();

        let contacts = directory.contacts("u1").unwrap();
        let ids: Vec<&str> = contacts.iter().map(|c| c.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u3"]);
        assert_eq!(contacts[0].display_label.as_deref(), Some("two@example.com"));
    }

    #[test]
    fn register_rejects_unusable_ids() {
        let directory = directory();
        assert!(matches!(
            directory.register(&user("", None)),
            Err(ChatError::InvalidParticipants(_))
        ));
        assert!(directory.register(&user("a_b", None)).is_err());
    }

    #[test]
    fn presence_is_connection_counted() {
        let directory = directory();
        directory.register(&user("u1", None)).unwrap();
        directory.register(&user("u2", None)).unwrap();
        let mut presence = directory.subscribe_presence();

        directory.user_online("u2", None);
        directory.user_online("u2", None);
        assert!(directory.is_online("u2"));
        assert!(directory.contacts("u1").unwrap()[0].online);

        directory.user_offline("u2");
        assert!(directory.is_online("u2"));
        directory.user_offline("u2");
        assert!(!directory.is_online("u2"));

        // One online and one offline broadcast, not four
        assert!(matches!(
            presence.try_recv(),
            Ok(GatewayEvent::PresenceUpdate { online: true, .. })
        ));
        assert!(matches!(
            presence.try_recv(),
            Ok(GatewayEvent::PresenceUpdate { online: false, .. })
        ));
        assert!(presence.try_recv().is_err());
    }
}
