use rolegate_core::policy::{
    PolicyFilter, PolicyTuple, RolePermissionMapping, UserGroup, UserGroupFilter,
};

use crate::proto::rolegate::v1;

pub fn policy_to_proto(tuple: &PolicyTuple) -> v1::Policy {
    v1::Policy {
        sub: tuple.sub.clone(),
        ns: tuple.ns.clone(),
        proj: tuple.proj.clone(),
        org: tuple.org.clone(),
        obj: tuple.obj.clone(),
        act: tuple.act.clone(),
    }
}

pub fn proto_to_policy(policy: v1::Policy) -> PolicyTuple {
    PolicyTuple {
        sub: policy.sub,
        ns: policy.ns,
        proj: policy.proj,
        org: policy.org,
        obj: policy.obj,
        act: policy.act,
    }
}

pub fn filter_to_proto(filter: &PolicyFilter) -> v1::Policy {
    v1::Policy {
        sub: filter.sub.clone(),
        ns: filter.ns.clone(),
        proj: filter.proj.clone(),
        org: filter.org.clone(),
        obj: filter.obj.clone(),
        act: filter.act.clone(),
    }
}

pub fn proto_to_filter(policy: v1::Policy) -> PolicyFilter {
    PolicyFilter {
        sub: policy.sub,
        ns: policy.ns,
        proj: policy.proj,
        org: policy.org,
        obj: policy.obj,
        act: policy.act,
    }
}

pub fn enforce_params(request: &PolicyTuple) -> v1::EnforceRequest {
    v1::EnforceRequest {
        params: vec![
            request.sub.clone(),
            request.ns.clone(),
            request.proj.clone(),
            request.org.clone(),
            request.obj.clone(),
            request.act.clone(),
        ],
    }
}

/// Reads positional enforce params. Missing trailing params are empty.
pub fn params_to_request(request: v1::EnforceRequest) -> PolicyTuple {
    let mut params = request.params.into_iter();
    let mut next = || params.next().unwrap_or_default();
    PolicyTuple {
        sub: next(),
        ns: next(),
        proj: next(),
        org: next(),
        obj: next(),
        act: next(),
    }
}

pub fn user_group_to_proto(user_group: &UserGroup) -> v1::UserGroup {
    v1::UserGroup {
        user: user_group.user.clone(),
        grp: user_group.grp.clone(),
        org: user_group.org.clone(),
    }
}

pub fn proto_to_user_group(user_group: v1::UserGroup) -> UserGroup {
    UserGroup {
        user: user_group.user,
        grp: user_group.grp,
        org: user_group.org,
    }
}

pub fn user_group_filter_to_proto(filter: &UserGroupFilter) -> v1::UserGroup {
    v1::UserGroup {
        user: filter.user.clone(),
        grp: filter.grp.clone(),
        org: filter.org.clone(),
    }
}

pub fn proto_to_user_group_filter(user_group: v1::UserGroup) -> UserGroupFilter {
    UserGroupFilter {
        user: user_group.user,
        grp: user_group.grp,
        org: user_group.org,
    }
}

pub fn mapping_to_proto(mapping: &RolePermissionMapping) -> v1::RolePermissionMapping {
    v1::RolePermissionMapping {
        role: mapping.role.clone(),
        permission: mapping.permissions.clone(),
    }
}

pub fn proto_to_mapping(mapping: v1::RolePermissionMapping) -> RolePermissionMapping {
    RolePermissionMapping {
        role: mapping.role,
        permissions: mapping.permission,
    }
}
