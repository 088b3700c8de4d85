pub const API_GROUP: &str = "hackathon.kaiyuanshe.cn";

/// Where the meta cluster lives; the namespace exists on every cluster.
pub const META_CLUSTER_NAMESPACE: &str = "default";
pub const META_CLUSTER_NAME: &str = "meta-cluster";
