use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};

use crate::error::{Error, Result};

/// Asks the cluster whether the current identity may perform `verb` on
/// `resource`, without attempting the operation.
pub(crate) async fn verb_allowed(
    client: &kube::Client,
    namespace: Option<&str>,
    group: &str,
    resource: &str,
    verb: &str,
) -> Result<bool> {
    let reviews: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                group: (!group.is_empty()).then(|| group.to_owned()),
                namespace: namespace.map(str::to_owned),
                resource: Some(resource.to_owned()),
                verb: Some(verb.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let created = reviews
        .create(&PostParams::default(), &review)
        .await
        .map_err(Error::from)?;
    Ok(created.status.map(|status| status.allowed).unwrap_or(false))
}

/// Pre-flights all `verbs` and fails with a permission error on the first
/// denial, before any mutating call is made.
pub(crate) async fn require_verbs(
    client: &kube::Client,
    namespace: Option<&str>,
    group: &str,
    resource: &str,
    verbs: &[&str],
) -> Result<()> {
    for verb in verbs {
        if !verb_allowed(client, namespace, group, resource, verb).await? {
            return Err(Error::Permission {
                verb: (*verb).to_owned(),
                resource: resource.to_owned(),
                namespace: namespace.unwrap_or("<cluster>").to_owned(),
            });
        }
    }
    Ok(())
}
