//! Where each record type lives in the tree.
//!
//! Ids passed here must already be valid keys: either listing keys or
//! references read through the model parsers.

use crate::tree_store::TreePath;

pub const POSTS: &str = "posts";
pub const APPLICATIONS: &str = "applications";
pub const USERS: &str = "users";
pub const SUBSCRIPTIONS: &str = "subscriptions";

/// Field holding the derived application index on posts and users.
pub const APPLICATIONS_INDEX: &str = "applications";
pub const PUSH_TOKEN: &str = "pushToken";

pub fn posts() -> TreePath {
    TreePath::root().child(POSTS)
}

pub fn post(post_id: &str) -> TreePath {
    posts().child(post_id)
}

pub fn post_applications(post_id: &str) -> TreePath {
    post(post_id).child(APPLICATIONS_INDEX)
}

pub fn post_application_entry(post_id: &str, application_id: &str) -> TreePath {
    post_applications(post_id).child(application_id)
}

pub fn applications() -> TreePath {
    TreePath::root().child(APPLICATIONS)
}

pub fn application(application_id: &str) -> TreePath {
    applications().child(application_id)
}

pub fn users() -> TreePath {
    TreePath::root().child(USERS)
}

pub fn user(user_id: &str) -> TreePath {
    users().child(user_id)
}

pub fn user_applications(user_id: &str) -> TreePath {
    user(user_id).child(APPLICATIONS_INDEX)
}

pub fn user_application_entry(user_id: &str, application_id: &str) -> TreePath {
    user_applications(user_id).child(application_id)
}

pub fn user_push_token(user_id: &str) -> TreePath {
    user(user_id).child(PUSH_TOKEN)
}

pub fn subscriptions() -> TreePath {
    TreePath::root().child(SUBSCRIPTIONS)
}
