/// Current user id and auth token, read from persisted local state
use crate::error::{Result, SyncError};
use crate::local_store::{LocalStore, TOKEN_KEY, USER_KEY};
use crate::model::{CurrentUser, Id};

#[derive(Debug, Clone)]
pub struct Identity {
    pub user: CurrentUser,
    pub token: String,
}

impl Identity {
    pub fn user_id(&self) -> &Id {
        &self.user.id
    }
}

/// Load the signed-in identity. Fails if either half is missing.
pub fn load(store: &LocalStore) -> Result<Identity> {
    let token = store
        .get(TOKEN_KEY)?
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| SyncError::Identity("No auth token stored; run `cli login`".to_string()))?;

    let user: CurrentUser = store
        .get_json(USER_KEY)
        .map_err(|e| SyncError::Identity(format!("Stored user is unreadable: {}", e)))?
        .ok_or_else(|| SyncError::Identity("No current user stored".to_string()))?;

    Ok(Identity {
        user,
        token: token.trim().to_string(),
    })
}

/// Persist an identity (written by the login command only)
pub fn save(store: &LocalStore, identity: &Identity) -> Result<()> {
    store.put(TOKEN_KEY, &identity.token)?;
    store.put_json(USER_KEY, &identity.user)?;
    Ok(())
}

/// Forget the stored identity
pub fn clear(store: &LocalStore) -> Result<()> {
    store.remove(TOKEN_KEY)?;
    store.remove(USER_KEY)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        assert!(matches!(load(&store), Err(SyncError::Identity(_))));

        let identity = Identity {
            user: CurrentUser {
                id: Id::Int(12),
                username: Some("ada".to_string()),
            },
            token: "tok-123".to_string(),
        };
        save(&store, &identity).unwrap();

        let loaded = load(&store).unwrap();
        assert_eq!(loaded.user_id(), &Id::Int(12));
        assert_eq!(loaded.token, "tok-123");

        clear(&store).unwrap();
        assert!(load(&store).is_err());
    }

    #[test]
    fn test_blank_token_is_missing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.put(TOKEN_KEY, "   ").unwrap();
        store.put(USER_KEY, r#"{"id": 1}"#).unwrap();
        assert!(matches!(load(&store), Err(SyncError::Identity(_))));
    }
}
