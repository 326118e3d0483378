//! Effective-user cache
//!
//! Hot users are cached by username with a TTL; updates and deletes
//! invalidate explicitly. Entries hold composed users, so a group change
//! invalidates all members.

use super::users::User;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CachedUser {
    user: User,
    expires_at: Instant,
}

pub struct UserCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedUser>>,
}

impl UserCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, username: &str) -> Option<User> {
        if !self.enabled() {
            return None;
        }
        let entries = self.entries.read().unwrap();
        entries.get(username).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.user.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, user: User) {
        if !self.enabled() {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        // Opportunistic sweep, the map stays small
        let now = Instant::now();
        entries.retain(|_, cached| cached.expires_at > now);
        entries.insert(
            user.username.clone(),
            CachedUser {
                user,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, username: &str) {
        self.entries.write().unwrap().remove(username);
    }

    pub fn invalidate_many<'a>(&self, usernames: impl IntoIterator<Item = &'a str>) {
        let mut entries = self.entries.write().unwrap();
        for username in usernames {
            entries.remove(username);
        }
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_invalidate() {
        let cache = UserCache::new(60);
        let user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        cache.put(user.clone());
        assert!(cache.get("alice").is_some());
        cache.invalidate("alice");
        assert!(cache.get("alice").is_none());
    }

    #[test]
    fn zero_ttl_disables() {
        let cache = UserCache::new(0);
        cache.put(User {
            username: "alice".to_string(),
            ..Default::default()
        });
        assert!(cache.get("alice").is_none());
    }
}
