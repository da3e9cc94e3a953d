//! Wire request/response types (spec §6). `Command` payloads are
//! length-prefixed MessagePack frames (see `server.rs`); this module only
//! defines their shape.

use std::collections::BTreeMap;

use marrow_auth::{AuthToken, Role, User};
use marrow_index::IndexDescriptor;
use marrow_model::{Document, Value, ValueKind};
use marrow_ttl::TtlStats;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Serialize, Deserialize)]
pub struct CursorOptionsWire {
    pub batch_size: Option<usize>,
    pub timeout_minutes: Option<u32>,
    pub include_total_count: bool,
    pub resume_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Ping,

    Insert {
        collection: String,
        id: Option<String>,
        data: BTreeMap<String, Value>,
    },
    Update {
        collection: String,
        id: String,
        patch: BTreeMap<String, Value>,
    },
    Replace {
        collection: String,
        id: String,
        data: BTreeMap<String, Value>,
    },
    Delete {
        collection: String,
        id: String,
    },
    Get {
        collection: String,
        id: String,
    },
    Exists {
        collection: String,
        id: String,
    },
    Count {
        collection: String,
    },
    CreateCollection {
        collection: String,
    },
    DropCollection {
        collection: String,
    },
    ListCollections,

    Query {
        collection: String,
        filter: Option<Json>,
        sort: Option<Json>,
        options: CursorOptionsWire,
    },
    Aggregate {
        collection: String,
        pipeline: Json,
    },

    CursorGetMore {
        cursor_id: String,
        batch_size: Option<usize>,
    },
    CursorKill {
        cursor_id: String,
    },

    IndexCreate {
        collection: String,
        field: String,
        kind: ValueKind,
        unique: bool,
    },
    IndexDrop {
        collection: String,
        field: String,
    },
    IndexList {
        collection: String,
    },

    TtlSetPolicy {
        collection: String,
        field: String,
        default_expire_after_secs: Option<u64>,
        immediate_deletion: bool,
        cleanup_interval_secs: u64,
    },
    TtlRemovePolicy {
        collection: String,
    },
    TtlStats,

    AuthRegister {
        username: String,
        password: String,
        roles: Vec<String>,
    },
    AuthAuthenticate {
        username: String,
        password: String,
    },
    AuthValidate {
        token: String,
    },
    AuthRevoke {
        token: String,
    },
    AuthChangePassword {
        user_id: String,
        old_password: String,
        new_password: String,
    },
    AuthAssignRole {
        username: String,
        role: String,
    },
    AuthRemoveRole {
        username: String,
        role: String,
    },
    AuthUserHasRole {
        username: String,
        role: String,
    },
    AuthUserHasPermission {
        username: String,
        permission: String,
    },
    AuthGetUserRoles {
        username: String,
    },
    AuthGetUserPermissions {
        username: String,
    },
    AuthCreateRole {
        name: String,
        permissions: Vec<String>,
    },
    AuthDeleteRole {
        name: String,
    },
    AuthGetAllRoles,
    AuthRemoveUser {
        username: String,
    },
    AuthAuthorize {
        token: String,
        permission: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryBatch {
    pub documents: Vec<BTreeMap<String, Value>>,
    pub cursor_id: Option<String>,
    pub has_more: bool,
    pub total_count: Option<usize>,
    pub resume_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineResultWire {
    pub success: bool,
    pub documents: Vec<BTreeMap<String, Value>>,
    pub count: usize,
    pub stages_executed: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ok,
    Bool(bool),
    Count(usize),
    Document(Option<Document>),
    Collections(Vec<String>),
    QueryBatch(QueryBatch),
    PipelineResult(PipelineResultWire),
    Indexes(Vec<IndexDescriptor>),
    TtlStats(TtlStats),
    AuthToken(AuthToken),
    User(User),
    Roles(Vec<Role>),
    Strings(Vec<String>),
    Error { kind: String, message: String },
}

impl Response {
    pub fn from_error(error: &marrow_model::Error) -> Response {
        Response::Error { kind: error_kind(error), message: error.to_string() }
    }
}

fn error_kind(error: &marrow_model::Error) -> String {
    use marrow_model::Error::*;
    match error {
        NotFound(_) => "NotFound",
        DuplicateId(_) => "DuplicateId",
        DuplicateKey(_) => "DuplicateKey",
        InvalidArgument(_) => "InvalidArgument",
        InvalidProjection(_) => "InvalidProjection",
        AggregationStageException { .. } => "AggregationStageException",
        CursorNotFound(_) => "CursorNotFound",
        CursorExpired(_) => "CursorExpired",
        InvalidToken => "InvalidToken",
        TokenExpired => "TokenExpired",
        InsufficientPermission(_) => "InsufficientPermission",
        StorageIoError(_) => "StorageIoError",
        AlreadyDisposed => "AlreadyDisposed",
        Cancelled => "Cancelled",
    }
    .to_string()
}
