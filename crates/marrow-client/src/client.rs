use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use marrow_auth::{AuthToken, Role, User};
use marrow_index::IndexDescriptor;
use marrow_model::{Document, Value, ValueKind};
use marrow_server::protocol::{CursorOptionsWire, PipelineResultWire, QueryBatch, Request, Response};
use marrow_ttl::TtlStats;
use serde_json::Value as Json;

#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Serialization(String),
    Server { kind: String, message: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "io error: {e}"),
            ClientError::Serialization(msg) => write!(f, "serialization error: {msg}"),
            ClientError::Server { kind, message } => write!(f, "server error [{kind}]: {message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<rmp_serde::encode::Error> for ClientError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClientError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Self { reader, writer })
    }

    fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        let bytes = rmp_serde::to_vec(&request)?;
        let len = (bytes.len() as u32).to_be_bytes();
        self.writer.write_all(&len)?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;

        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut msg_buf = vec![0u8; len];
        self.reader.read_exact(&mut msg_buf)?;

        let response: Response = rmp_serde::from_slice(&msg_buf)?;
        Ok(response)
    }

    fn expect_ok(&mut self, request: Request) -> Result<(), ClientError> {
        match self.request(request)? {
            Response::Ok => Ok(()),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        match self.request(Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn insert(
        &mut self,
        collection: &str,
        id: Option<String>,
        data: BTreeMap<String, Value>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::Insert { collection: collection.to_string(), id, data })
    }

    pub fn update(
        &mut self,
        collection: &str,
        id: &str,
        patch: BTreeMap<String, Value>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::Update { collection: collection.to_string(), id: id.to_string(), patch })
    }

    pub fn replace(
        &mut self,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document, ClientError> {
        self.expect_document(Request::Replace { collection: collection.to_string(), id: id.to_string(), data })
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> Result<bool, ClientError> {
        self.expect_bool(Request::Delete { collection: collection.to_string(), id: id.to_string() })
    }

    pub fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>, ClientError> {
        match self.request(Request::Get { collection: collection.to_string(), id: id.to_string() })? {
            Response::Document(doc) => Ok(doc),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn exists(&mut self, collection: &str, id: &str) -> Result<bool, ClientError> {
        self.expect_bool(Request::Exists { collection: collection.to_string(), id: id.to_string() })
    }

    pub fn count(&mut self, collection: &str) -> Result<usize, ClientError> {
        match self.request(Request::Count { collection: collection.to_string() })? {
            Response::Count(n) => Ok(n),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn create_collection(&mut self, collection: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::CreateCollection { collection: collection.to_string() })
    }

    pub fn drop_collection(&mut self, collection: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::DropCollection { collection: collection.to_string() })
    }

    pub fn list_collections(&mut self) -> Result<Vec<String>, ClientError> {
        match self.request(Request::ListCollections)? {
            Response::Collections(names) => Ok(names),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn query(
        &mut self,
        collection: &str,
        filter: Option<Json>,
        sort: Option<Json>,
        options: CursorOptionsWire,
    ) -> Result<QueryBatch, ClientError> {
        self.expect_query_batch(Request::Query { collection: collection.to_string(), filter, sort, options })
    }

    pub fn cursor_get_more(&mut self, cursor_id: &str, batch_size: Option<usize>) -> Result<QueryBatch, ClientError> {
        self.expect_query_batch(Request::CursorGetMore { cursor_id: cursor_id.to_string(), batch_size })
    }

    pub fn cursor_kill(&mut self, cursor_id: &str) -> Result<bool, ClientError> {
        self.expect_bool(Request::CursorKill { cursor_id: cursor_id.to_string() })
    }

    pub fn aggregate(&mut self, collection: &str, pipeline: Json) -> Result<PipelineResultWire, ClientError> {
        match self.request(Request::Aggregate { collection: collection.to_string(), pipeline })? {
            Response::PipelineResult(result) => Ok(result),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn create_index(&mut self, collection: &str, field: &str, kind: ValueKind, unique: bool) -> Result<(), ClientError> {
        self.expect_ok(Request::IndexCreate { collection: collection.to_string(), field: field.to_string(), kind, unique })
    }

    pub fn drop_index(&mut self, collection: &str, field: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::IndexDrop { collection: collection.to_string(), field: field.to_string() })
    }

    pub fn list_indexes(&mut self, collection: &str) -> Result<Vec<IndexDescriptor>, ClientError> {
        match self.request(Request::IndexList { collection: collection.to_string() })? {
            Response::Indexes(indexes) => Ok(indexes),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_ttl_policy(
        &mut self,
        collection: &str,
        field: &str,
        default_expire_after_secs: Option<u64>,
        immediate_deletion: bool,
        cleanup_interval_secs: u64,
    ) -> Result<(), ClientError> {
        self.expect_ok(Request::TtlSetPolicy {
            collection: collection.to_string(),
            field: field.to_string(),
            default_expire_after_secs,
            immediate_deletion,
            cleanup_interval_secs,
        })
    }

    pub fn remove_ttl_policy(&mut self, collection: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::TtlRemovePolicy { collection: collection.to_string() })
    }

    pub fn ttl_stats(&mut self) -> Result<TtlStats, ClientError> {
        match self.request(Request::TtlStats)? {
            Response::TtlStats(stats) => Ok(stats),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn auth_register(&mut self, username: &str, password: &str, roles: Vec<String>) -> Result<User, ClientError> {
        self.expect_user(Request::AuthRegister { username: username.to_string(), password: password.to_string(), roles })
    }

    pub fn auth_authenticate(&mut self, username: &str, password: &str) -> Result<AuthToken, ClientError> {
        match self.request(Request::AuthAuthenticate { username: username.to_string(), password: password.to_string() })? {
            Response::AuthToken(token) => Ok(token),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn auth_validate(&mut self, token: &str) -> Result<User, ClientError> {
        self.expect_user(Request::AuthValidate { token: token.to_string() })
    }

    pub fn auth_revoke(&mut self, token: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthRevoke { token: token.to_string() })
    }

    pub fn auth_change_password(&mut self, user_id: &str, old_password: &str, new_password: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthChangePassword {
            user_id: user_id.to_string(),
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        })
    }

    pub fn auth_assign_role(&mut self, username: &str, role: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthAssignRole { username: username.to_string(), role: role.to_string() })
    }

    pub fn auth_remove_role(&mut self, username: &str, role: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthRemoveRole { username: username.to_string(), role: role.to_string() })
    }

    pub fn auth_user_has_role(&mut self, username: &str, role: &str) -> Result<bool, ClientError> {
        self.expect_bool(Request::AuthUserHasRole { username: username.to_string(), role: role.to_string() })
    }

    pub fn auth_user_has_permission(&mut self, username: &str, permission: &str) -> Result<bool, ClientError> {
        self.expect_bool(Request::AuthUserHasPermission { username: username.to_string(), permission: permission.to_string() })
    }

    pub fn auth_get_user_roles(&mut self, username: &str) -> Result<Vec<String>, ClientError> {
        self.expect_strings(Request::AuthGetUserRoles { username: username.to_string() })
    }

    pub fn auth_get_user_permissions(&mut self, username: &str) -> Result<Vec<String>, ClientError> {
        self.expect_strings(Request::AuthGetUserPermissions { username: username.to_string() })
    }

    pub fn auth_create_role(&mut self, name: &str, permissions: Vec<String>) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthCreateRole { name: name.to_string(), permissions })
    }

    pub fn auth_delete_role(&mut self, name: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthDeleteRole { name: name.to_string() })
    }

    pub fn auth_get_all_roles(&mut self) -> Result<Vec<Role>, ClientError> {
        match self.request(Request::AuthGetAllRoles)? {
            Response::Roles(roles) => Ok(roles),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    pub fn auth_remove_user(&mut self, username: &str) -> Result<(), ClientError> {
        self.expect_ok(Request::AuthRemoveUser { username: username.to_string() })
    }

    pub fn auth_authorize(&mut self, token: &str, permission: &str) -> Result<User, ClientError> {
        self.expect_user(Request::AuthAuthorize { token: token.to_string(), permission: permission.to_string() })
    }

    fn expect_document(&mut self, request: Request) -> Result<Document, ClientError> {
        match self.request(request)? {
            Response::Document(Some(doc)) => Ok(doc),
            Response::Document(None) => Err(ClientError::Server {
                kind: "NotFound".to_string(),
                message: "document not returned".to_string(),
            }),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    fn expect_bool(&mut self, request: Request) -> Result<bool, ClientError> {
        match self.request(request)? {
            Response::Bool(b) => Ok(b),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    fn expect_query_batch(&mut self, request: Request) -> Result<QueryBatch, ClientError> {
        match self.request(request)? {
            Response::QueryBatch(batch) => Ok(batch),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    fn expect_user(&mut self, request: Request) -> Result<User, ClientError> {
        match self.request(request)? {
            Response::User(user) => Ok(user),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }

    fn expect_strings(&mut self, request: Request) -> Result<Vec<String>, ClientError> {
        match self.request(request)? {
            Response::Strings(strings) => Ok(strings),
            Response::Error { kind, message } => Err(ClientError::Server { kind, message }),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Server { kind: "UnexpectedResponse".to_string(), message: format!("{response:?}") }
}
