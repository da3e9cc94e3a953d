//! Per-connection request dispatch (spec §6's `Command` handling).

use std::sync::Arc;
use std::time::Duration;

use marrow_auth::AuthService;
use marrow_cursor::{CursorManager, CursorOptions};
use marrow_model::Error;
use marrow_query::{apply_sort, parse_filter, parse_pipeline, parse_sort, run_pipeline};
use marrow_store::DocumentStore;
use marrow_ttl::TtlPolicy;
use serde_json::Value as Json;

use crate::protocol::{PipelineResultWire, QueryBatch, Request, Response};

pub struct Session {
    store: Arc<DocumentStore>,
    cursors: Arc<CursorManager>,
    auth: Arc<AuthService>,
}

impl Session {
    pub fn new(store: Arc<DocumentStore>, cursors: Arc<CursorManager>, auth: Arc<AuthService>) -> Self {
        Session { store, cursors, auth }
    }

    #[tracing::instrument(skip(self, request), fields(variant = request_kind(&request)))]
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "request failed");
                Response::from_error(&e)
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response, Error> {
        match request {
            Request::Ping => Ok(Response::Pong),

            Request::Insert { collection, id, data } => {
                let doc = self.store.insert(&collection, id, data)?;
                Ok(Response::Document(Some(doc)))
            }
            Request::Update { collection, id, patch } => {
                let doc = self.store.update(&collection, &id, patch)?;
                Ok(Response::Document(Some(doc)))
            }
            Request::Replace { collection, id, data } => {
                let doc = self.store.replace(&collection, &id, data)?;
                Ok(Response::Document(Some(doc)))
            }
            Request::Delete { collection, id } => {
                let removed = self.store.delete(&collection, &id)?;
                Ok(Response::Bool(removed))
            }
            Request::Get { collection, id } => Ok(Response::Document(self.store.get(&collection, &id))),
            Request::Exists { collection, id } => Ok(Response::Bool(self.store.exists(&collection, &id))),
            Request::Count { collection } => Ok(Response::Count(self.store.count(&collection))),
            Request::CreateCollection { collection } => {
                self.store.create_collection(&collection);
                Ok(Response::Ok)
            }
            Request::DropCollection { collection } => {
                self.store.drop_collection(&collection)?;
                self.cursors.kill_cursors_for_collection(&collection);
                Ok(Response::Ok)
            }
            Request::ListCollections => Ok(Response::Collections(self.store.list_collections())),

            Request::Query { collection, filter, sort, options } => {
                self.query(&collection, filter, sort, options)
            }
            Request::Aggregate { collection, pipeline } => self.aggregate(&collection, pipeline),

            Request::CursorGetMore { cursor_id, batch_size } => {
                let batch = self.cursors.get_more(&cursor_id, batch_size)?;
                Ok(Response::QueryBatch(self.to_query_batch(batch)))
            }
            Request::CursorKill { cursor_id } => Ok(Response::Bool(self.cursors.kill(&cursor_id))),

            Request::IndexCreate { collection, field, kind, unique } => {
                self.store.create_index(&collection, &field, kind, unique)?;
                Ok(Response::Ok)
            }
            Request::IndexDrop { collection, field } => {
                self.store.drop_index(&collection, &field);
                Ok(Response::Ok)
            }
            Request::IndexList { collection } => Ok(Response::Indexes(self.store.list_indexes(&collection))),

            Request::TtlSetPolicy { collection, field, default_expire_after_secs, immediate_deletion, cleanup_interval_secs } => {
                self.store.set_ttl_policy(
                    &collection,
                    TtlPolicy {
                        field,
                        default_expire_after: default_expire_after_secs.map(Duration::from_secs),
                        immediate_deletion,
                        cleanup_interval: Duration::from_secs(cleanup_interval_secs),
                    },
                )?;
                Ok(Response::Ok)
            }
            Request::TtlRemovePolicy { collection } => {
                self.store.remove_ttl_policy(&collection)?;
                Ok(Response::Ok)
            }
            Request::TtlStats => Ok(Response::TtlStats(self.store.ttl_stats())),

            Request::AuthRegister { username, password, roles } => {
                Ok(Response::User(self.auth.register_user(&username, &password, roles)?))
            }
            Request::AuthAuthenticate { username, password } => {
                Ok(Response::AuthToken(self.auth.authenticate(&username, &password, Some(24 * 3_600_000))?))
            }
            Request::AuthValidate { token } => Ok(Response::User(self.auth.validate_token(&token)?)),
            Request::AuthRevoke { token } => {
                self.auth.revoke_token(&token)?;
                Ok(Response::Ok)
            }
            Request::AuthChangePassword { user_id, old_password, new_password } => {
                self.auth.change_password(&user_id, &old_password, &new_password)?;
                Ok(Response::Ok)
            }
            Request::AuthAssignRole { username, role } => {
                let user = self.auth.find_user_by_username(&username)?;
                self.auth.assign_role(&user.id, &role)?;
                Ok(Response::Ok)
            }
            Request::AuthRemoveRole { username, role } => {
                let user = self.auth.find_user_by_username(&username)?;
                self.auth.remove_role(&user.id, &role)?;
                Ok(Response::Ok)
            }
            Request::AuthUserHasRole { username, role } => {
                let user = self.auth.find_user_by_username(&username)?;
                Ok(Response::Bool(self.auth.user_has_role(&user.id, &role)))
            }
            Request::AuthUserHasPermission { username, permission } => {
                let user = self.auth.find_user_by_username(&username)?;
                Ok(Response::Bool(self.auth.user_has_permission(&user.id, &permission)))
            }
            Request::AuthGetUserRoles { username } => {
                let user = self.auth.find_user_by_username(&username)?;
                Ok(Response::Strings(self.auth.get_user_roles(&user.id)))
            }
            Request::AuthGetUserPermissions { username } => {
                let user = self.auth.find_user_by_username(&username)?;
                Ok(Response::Strings(self.auth.get_user_permissions(&user.id)))
            }
            Request::AuthCreateRole { name, permissions } => {
                self.auth.create_role(&name, permissions)?;
                Ok(Response::Ok)
            }
            Request::AuthDeleteRole { name } => {
                self.auth.delete_role(&name)?;
                Ok(Response::Ok)
            }
            Request::AuthGetAllRoles => Ok(Response::Roles(self.auth.get_all_roles())),
            Request::AuthRemoveUser { username } => {
                let user = self.auth.find_user_by_username(&username)?;
                self.auth.remove_user(&user.id)?;
                Ok(Response::Ok)
            }
            Request::AuthAuthorize { token, permission } => {
                Ok(Response::User(self.auth.authorize(&token, &permission)?))
            }
        }
    }

    fn query(
        &self,
        collection: &str,
        filter: Option<Json>,
        sort: Option<Json>,
        options: crate::protocol::CursorOptionsWire,
    ) -> Result<Response, Error> {
        let filter_json = filter.unwrap_or(Json::Object(Default::default()));
        let sort_json = sort.unwrap_or(Json::Array(Vec::new()));

        let filter_tree = parse_filter(&filter_json)?;
        let sort_keys = parse_sort(&sort_json)?;

        let mut rows: Vec<_> = self.store.scan(collection).iter().map(|d| d.to_attrs()).collect();
        rows.retain(|row| filter_tree.evaluate(row));
        apply_sort(&mut rows, &sort_keys);

        let cursor_options = CursorOptions {
            batch_size: options.batch_size.unwrap_or(marrow_cursor::DEFAULT_BATCH_SIZE),
            timeout_minutes: options.timeout_minutes.unwrap_or(marrow_cursor::DEFAULT_TIMEOUT_MINUTES),
            include_total_count: options.include_total_count,
            resume_token: options.resume_token,
        };

        let batch = self.cursors.create_cursor(collection, rows, filter_json, sort_json, cursor_options)?;
        Ok(Response::QueryBatch(self.to_query_batch(batch)))
    }

    fn aggregate(&self, collection: &str, pipeline: Json) -> Result<Response, Error> {
        let stages = parse_pipeline(&pipeline)?;
        let rows: Vec<_> = self.store.scan(collection).iter().map(|d| d.to_attrs()).collect();
        let result = run_pipeline(rows, &stages);
        Ok(Response::PipelineResult(PipelineResultWire {
            success: result.success,
            documents: result.documents,
            count: result.count,
            stages_executed: result.stages_executed,
            error_message: result.error_message,
        }))
    }

    fn to_query_batch(&self, batch: marrow_cursor::CursorBatch) -> QueryBatch {
        let resume_token = batch.cursor_id.as_deref().and_then(|id| self.cursors.resume_token_for(id));
        QueryBatch {
            documents: batch.documents,
            cursor_id: batch.cursor_id,
            has_more: !batch.done,
            total_count: batch.total_count,
            resume_token,
        }
    }
}

fn request_kind(request: &Request) -> &'static str {
    match request {
        Request::Ping => "ping",
        Request::Insert { .. } => "insert",
        Request::Update { .. } => "update",
        Request::Replace { .. } => "replace",
        Request::Delete { .. } => "delete",
        Request::Get { .. } => "get",
        Request::Exists { .. } => "exists",
        Request::Count { .. } => "count",
        Request::CreateCollection { .. } => "create_collection",
        Request::DropCollection { .. } => "drop_collection",
        Request::ListCollections => "list_collections",
        Request::Query { .. } => "query",
        Request::Aggregate { .. } => "aggregate",
        Request::CursorGetMore { .. } => "cursor_get_more",
        Request::CursorKill { .. } => "cursor_kill",
        Request::IndexCreate { .. } => "index_create",
        Request::IndexDrop { .. } => "index_drop",
        Request::IndexList { .. } => "index_list",
        Request::TtlSetPolicy { .. } => "ttl_set_policy",
        Request::TtlRemovePolicy { .. } => "ttl_remove_policy",
        Request::TtlStats => "ttl_stats",
        Request::AuthRegister { .. } => "auth_register",
        Request::AuthAuthenticate { .. } => "auth_authenticate",
        Request::AuthValidate { .. } => "auth_validate",
        Request::AuthRevoke { .. } => "auth_revoke",
        Request::AuthChangePassword { .. } => "auth_change_password",
        Request::AuthAssignRole { .. } => "auth_assign_role",
        Request::AuthRemoveRole { .. } => "auth_remove_role",
        Request::AuthUserHasRole { .. } => "auth_user_has_role",
        Request::AuthUserHasPermission { .. } => "auth_user_has_permission",
        Request::AuthGetUserRoles { .. } => "auth_get_user_roles",
        Request::AuthGetUserPermissions { .. } => "auth_get_user_permissions",
        Request::AuthCreateRole { .. } => "auth_create_role",
        Request::AuthDeleteRole { .. } => "auth_delete_role",
        Request::AuthGetAllRoles => "auth_get_all_roles",
        Request::AuthRemoveUser { .. } => "auth_remove_user",
        Request::AuthAuthorize { .. } => "auth_authorize",
    }
}
