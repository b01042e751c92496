use rolegate_core::policy::{
    PolicyFilter, PolicyTuple, RolePermissionMapping, UserGroup, UserGroupFilter,
};
use rolegate_core::sync::{EnforcementEngine, EngineError};
use tonic::transport::Channel;

use crate::config::ClientOptions;
use crate::conversions;
use crate::error::ClientError;
use crate::interceptor::EngineAuthInterceptor;
use crate::proto::rolegate::v1::{self, authz_client::AuthzClient};

type InterceptedChannel =
    tonic::service::interceptor::InterceptedService<Channel, EngineAuthInterceptor>;

/// gRPC adapter for the enforcement engine.
#[derive(Clone)]
pub struct AuthzEngineClient {
    inner: AuthzClient<InterceptedChannel>,
}

impl AuthzEngineClient {
    pub async fn connect(endpoint: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| ClientError::Connection(e.to_string()))?
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .connect()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Self::from_channel(channel, options)
    }

    /// Builds a client whose channel connects on first use.
    pub fn connect_lazy(endpoint: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let channel = Channel::from_shared(endpoint.to_string())
            .map_err(|e| ClientError::Connection(e.to_string()))?
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .connect_lazy();

        Self::from_channel(channel, options)
    }

    pub fn from_channel(channel: Channel, options: ClientOptions) -> Result<Self, ClientError> {
        let interceptor = EngineAuthInterceptor::new(options.api_key.as_deref())
            .map_err(|s| ClientError::InvalidArgument(s.message().to_string()))?;
        Ok(Self {
            inner: AuthzClient::with_interceptor(channel, interceptor),
        })
    }

    fn client(&self) -> AuthzClient<InterceptedChannel> {
        self.inner.clone()
    }
}

fn acknowledged(reply: v1::BoolReply, rpc: &'static str) -> Result<(), EngineError> {
    if reply.res {
        Ok(())
    } else {
        Err(ClientError::Rejected(rpc).into())
    }
}

fn status_to_engine(status: tonic::Status) -> EngineError {
    ClientError::from(status).into()
}

impl EnforcementEngine for AuthzEngineClient {
    async fn enforce(&self, request: &PolicyTuple) -> Result<bool, EngineError> {
        let reply = self
            .client()
            .enforce(conversions::enforce_params(request))
            .await
            .map_err(status_to_engine)?
            .into_inner();
        Ok(reply.res)
    }

    async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PolicyTuple>, EngineError> {
        let reply = self
            .client()
            .list_policies(conversions::filter_to_proto(filter))
            .await
            .map_err(status_to_engine)?
            .into_inner();
        Ok(reply
            .policies
            .into_iter()
            .map(conversions::proto_to_policy)
            .collect())
    }

    async fn create_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
        let request = v1::Policies {
            policies: policies.iter().map(conversions::policy_to_proto).collect(),
        };
        let reply = self
            .client()
            .create_policies(request)
            .await
            .map_err(status_to_engine)?
            .into_inner();
        tracing::debug!(count = policies.len(), ok = reply.res, "CreatePolicies");
        acknowledged(reply, "CreatePolicies")
    }

    async fn delete_policies(&self, filter: &PolicyFilter) -> Result<(), EngineError> {
        let reply = self
            .client()
            .delete_policies(conversions::filter_to_proto(filter))
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "DeletePolicies")
    }

    async fn remove_policies(&self, policies: &[PolicyTuple]) -> Result<(), EngineError> {
        let request = v1::Policies {
            policies: policies.iter().map(conversions::policy_to_proto).collect(),
        };
        let reply = self
            .client()
            .remove_policies(request)
            .await
            .map_err(status_to_engine)?
            .into_inner();
        tracing::debug!(count = policies.len(), ok = reply.res, "RemovePolicies");
        acknowledged(reply, "RemovePolicies")
    }

    async fn list_user_groups(
        &self,
        filter: &UserGroupFilter,
    ) -> Result<Vec<UserGroup>, EngineError> {
        let reply = self
            .client()
            .list_user_groups(conversions::user_group_filter_to_proto(filter))
            .await
            .map_err(status_to_engine)?
            .into_inner();
        Ok(reply
            .user_groups
            .into_iter()
            .map(conversions::proto_to_user_group)
            .collect())
    }

    async fn create_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
        let request = v1::UserGroups {
            user_groups: user_groups
                .iter()
                .map(conversions::user_group_to_proto)
                .collect(),
        };
        let reply = self
            .client()
            .create_user_groups(request)
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "CreateUserGroups")
    }

    async fn delete_user_groups(&self, filter: &UserGroupFilter) -> Result<(), EngineError> {
        let reply = self
            .client()
            .delete_user_groups(conversions::user_group_filter_to_proto(filter))
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "DeleteUserGroups")
    }

    async fn remove_user_groups(&self, user_groups: &[UserGroup]) -> Result<(), EngineError> {
        let request = v1::UserGroups {
            user_groups: user_groups
                .iter()
                .map(conversions::user_group_to_proto)
                .collect(),
        };
        let reply = self
            .client()
            .remove_user_groups(request)
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "RemoveUserGroups")
    }

    async fn list_role_permission_mappings(
        &self,
        role: &str,
    ) -> Result<Vec<RolePermissionMapping>, EngineError> {
        let reply = self
            .client()
            .list_role_permission_mappings(v1::FilteredRolePermissionMapping {
                role: role.to_string(),
            })
            .await
            .map_err(status_to_engine)?
            .into_inner();
        Ok(reply
            .role_permission_mapping_list
            .into_iter()
            .map(conversions::proto_to_mapping)
            .collect())
    }

    async fn create_role_permission_mappings(
        &self,
        mappings: &[RolePermissionMapping],
    ) -> Result<(), EngineError> {
        let request = v1::RolePermissionMappingList {
            role_permission_mapping_list: mappings
                .iter()
                .map(conversions::mapping_to_proto)
                .collect(),
        };
        let reply = self
            .client()
            .create_role_permission_mappings(request)
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "CreateRolePermissionMappings")
    }

    async fn delete_role_permission_mappings(&self, role: &str) -> Result<(), EngineError> {
        let reply = self
            .client()
            .delete_role_permission_mappings(v1::FilteredRolePermissionMapping {
                role: role.to_string(),
            })
            .await
            .map_err(status_to_engine)?
            .into_inner();
        acknowledged(reply, "DeleteRolePermissionMappings")
    }
}
