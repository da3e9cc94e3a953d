//! Users, roles, and bearer tokens (component C9).
//!
//! Passwords are hashed with Argon2id; tokens are opaque UUIDv4 strings
//! tracked server-side rather than self-describing JWTs, so revocation is
//! an immediate map removal rather than a blocklist.

use std::collections::HashMap;
use std::sync::RwLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::Argon2;
use marrow_model::{Error, now_millis};
use serde::{Deserialize, Serialize};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
pub const ROLE_READ_ONLY: &str = "read_only";
pub const ROLE_SERVICE_READER: &str = "service_reader";
pub const ROLE_SERVICE_WRITER: &str = "service_writer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<String>,
    built_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub roles: Vec<String>,
    pub created_at: i64,
}

struct StoredUser {
    user: User,
    password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl AuthToken {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

pub struct AuthService {
    users: RwLock<HashMap<String, StoredUser>>,
    username_index: RwLock<HashMap<String, String>>,
    roles: RwLock<HashMap<String, Role>>,
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthService {
    pub fn new() -> Self {
        let mut roles = HashMap::new();
        for (name, permissions) in [
            (ROLE_ADMIN, vec!["read".to_string(), "write".to_string()]),
            (ROLE_USER, vec!["read".to_string(), "write".to_string()]),
            (ROLE_READ_ONLY, vec!["read".to_string()]),
            (ROLE_SERVICE_READER, vec!["read".to_string()]),
            (ROLE_SERVICE_WRITER, vec!["write".to_string()]),
        ] {
            roles.insert(name.to_string(), Role { name: name.to_string(), permissions, built_in: true });
        }

        Self {
            users: RwLock::new(HashMap::new()),
            username_index: RwLock::new(HashMap::new()),
            roles: RwLock::new(roles),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_user(
        &self,
        username: &str,
        password: &str,
        roles: Vec<String>,
    ) -> Result<User, Error> {
        {
            let index = self.username_index.read().unwrap();
            if index.contains_key(username) {
                return Err(Error::DuplicateId(username.to_string()));
            }
        }
        {
            let known = self.roles.read().unwrap();
            for role in &roles {
                if !known.contains_key(role) {
                    return Err(Error::InvalidArgument(format!("unknown role: {role}")));
                }
            }
        }

        let password_hash = hash_password(password)?;
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            roles,
            created_at: now_millis(),
        };

        self.username_index.write().unwrap().insert(username.to_string(), user.id.clone());
        self.users
            .write()
            .unwrap()
            .insert(user.id.clone(), StoredUser { user: user.clone(), password_hash });
        Ok(user)
    }

    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        ttl_millis: Option<i64>,
    ) -> Result<AuthToken, Error> {
        let user_id = self
            .username_index
            .read()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or(Error::InvalidToken)?;

        let users = self.users.read().unwrap();
        let stored = users.get(&user_id).ok_or(Error::InvalidToken)?;
        verify_password(password, &stored.password_hash)?;

        let now = now_millis();
        let token = AuthToken {
            token: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            created_at: now,
            expires_at: ttl_millis.map(|ttl| now + ttl),
        };
        self.tokens.write().unwrap().insert(token.token.clone(), token.clone());
        Ok(token)
    }

    pub fn validate_token(&self, token: &str) -> Result<User, Error> {
        let now = now_millis();
        let user_id = {
            let tokens = self.tokens.read().unwrap();
            let entry = tokens.get(token).ok_or(Error::InvalidToken)?;
            if entry.is_expired(now) {
                return Err(Error::TokenExpired);
            }
            entry.user_id.clone()
        };

        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .map(|s| s.user.clone())
            .ok_or(Error::InvalidToken)
    }

    pub fn revoke_token(&self, token: &str) -> Result<(), Error> {
        self.tokens
            .write()
            .unwrap()
            .remove(token)
            .map(|_| ())
            .ok_or(Error::InvalidToken)
    }

    pub fn change_password(&self, user_id: &str, old_password: &str, new_password: &str) -> Result<(), Error> {
        let mut users = self.users.write().unwrap();
        let stored = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        verify_password(old_password, &stored.password_hash)?;
        stored.password_hash = hash_password(new_password)?;
        Ok(())
    }

    pub fn assign_role(&self, user_id: &str, role_name: &str) -> Result<(), Error> {
        if !self.roles.read().unwrap().contains_key(role_name) {
            return Err(Error::InvalidArgument(format!("unknown role: {role_name}")));
        }
        let mut users = self.users.write().unwrap();
        let stored = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        if !stored.user.roles.iter().any(|r| r == role_name) {
            stored.user.roles.push(role_name.to_string());
        }
        Ok(())
    }

    pub fn remove_role(&self, user_id: &str, role_name: &str) -> Result<(), Error> {
        let mut users = self.users.write().unwrap();
        let stored = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        stored.user.roles.retain(|r| r != role_name);
        Ok(())
    }

    pub fn user_has_role(&self, user_id: &str, role_name: &str) -> bool {
        self.get_user_roles(user_id).iter().any(|r| r == role_name)
    }

    /// Exact match only (spec §4.8: "Permission identifiers are matched
    /// exactly (no wildcarding)").
    pub fn user_has_permission(&self, user_id: &str, permission: &str) -> bool {
        self.get_user_permissions(user_id).iter().any(|p| p == permission)
    }

    pub fn get_user_roles(&self, user_id: &str) -> Vec<String> {
        self.users
            .read()
            .unwrap()
            .get(user_id)
            .map(|s| s.user.roles.clone())
            .unwrap_or_default()
    }

    pub fn get_user_permissions(&self, user_id: &str) -> Vec<String> {
        let role_names = self.get_user_roles(user_id);
        let roles = self.roles.read().unwrap();
        let mut permissions: Vec<String> = Vec::new();
        for name in role_names {
            if let Some(role) = roles.get(&name) {
                for perm in &role.permissions {
                    if !permissions.contains(perm) {
                        permissions.push(perm.clone());
                    }
                }
            }
        }
        permissions
    }

    pub fn create_role(&self, name: &str, permissions: Vec<String>) -> Result<(), Error> {
        let mut roles = self.roles.write().unwrap();
        if roles.contains_key(name) {
            return Err(Error::DuplicateId(name.to_string()));
        }
        roles.insert(name.to_string(), Role { name: name.to_string(), permissions, built_in: false });
        Ok(())
    }

    pub fn delete_role(&self, name: &str) -> Result<(), Error> {
        let mut roles = self.roles.write().unwrap();
        match roles.get(name) {
            Some(role) if role.built_in => {
                Err(Error::InvalidArgument(format!("role {name} is built in and cannot be deleted")))
            }
            Some(_) => {
                roles.remove(name);
                Ok(())
            }
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    pub fn get_all_roles(&self) -> Vec<Role> {
        self.roles.read().unwrap().values().cloned().collect()
    }

    /// Resolve a username to its user id, the lookup every username-keyed
    /// wire operation needs before it can call the id-keyed methods above.
    pub fn find_user_by_username(&self, username: &str) -> Result<User, Error> {
        let user_id = self
            .username_index
            .read()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or_else(|| Error::NotFound(username.to_string()))?;
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .map(|s| s.user.clone())
            .ok_or_else(|| Error::NotFound(username.to_string()))
    }

    pub fn remove_user(&self, user_id: &str) -> Result<(), Error> {
        let mut users = self.users.write().unwrap();
        let stored = users.remove(user_id).ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        self.username_index.write().unwrap().remove(&stored.user.username);
        self.tokens.write().unwrap().retain(|_, t| t.user_id != user_id);
        Ok(())
    }

    /// Validate a token and require it to carry `permission`, in one call
    /// (the shape every server request handler needs before dispatching).
    pub fn authorize(&self, token: &str, permission: &str) -> Result<User, Error> {
        let user = self.validate_token(token)?;
        if self.user_has_permission(&user.id, permission) {
            Ok(user)
        } else {
            Err(Error::InsufficientPermission(permission.to_string()))
        }
    }
}

fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::InvalidArgument(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, hash: &str) -> Result<(), Error> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::InvalidArgument(format!("stored password hash is corrupt: {e}")))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| Error::InvalidToken)
}
