//! Registry key layout for discovery.
//!
//! ```text
//! /_etcd/registry/<token>                      cluster prefix
//! /_etcd/registry/<token>/_config/size         configured cluster size
//! /_etcd/registry/<token>/members              member prefix
//! /_etcd/registry/<token>/members/<member-id>  one registration
//! ```

/// Root under which every discovery cluster lives.
pub const REGISTRY_ROOT: &str = "/_etcd/registry";

/// `/_etcd/registry/<token>`
#[must_use]
pub fn cluster_prefix(token: &str) -> String {
    join(REGISTRY_ROOT, token)
}

/// `/_etcd/registry/<token>/_config/size`
#[must_use]
pub fn cluster_size_key(token: &str) -> String {
    join(&cluster_prefix(token), "_config/size")
}

/// `/_etcd/registry/<token>/members`
#[must_use]
pub fn member_prefix(token: &str) -> String {
    join(&cluster_prefix(token), "members")
}

/// `/_etcd/registry/<token>/members/<member_id>`
#[must_use]
pub fn member_key(token: &str, member_id: &str) -> String {
    join(&member_prefix(token), member_id)
}

/// Joins two slash-separated paths into a clean absolute path: empty and `.`
/// segments are dropped and `..` removes the preceding segment.
fn join(base: &str, tail: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in base.split('/').chain(tail.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    format!("/{}", segments.join("/"))
}
