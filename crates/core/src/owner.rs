//! Ownership links between child objects and the entity that generated them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::Resource;

use crate::ReconcileError;

/// Mark `owner` as the controlling owner of `child`, enabling cascading
/// delete. A child carries at most one controller link: linking it to a
/// second, different controller fails.
pub fn set_owner<O>(child: &mut ObjectMeta, owner: &O) -> Result<(), ReconcileError>
where
    O: Resource<DynamicType = ()>,
{
    let link = owner.controller_owner_ref(&()).ok_or_else(|| {
        ReconcileError::Misconfigured(format!(
            "owner {} has no uid; it must be read from the store first",
            owner.meta().name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    let refs = child.owner_references.get_or_insert_with(Vec::new);
    if let Some(existing) = refs.iter().find(|r| r.controller == Some(true)) {
        if existing.uid != link.uid {
            return Err(ReconcileError::Misconfigured(format!(
                "{} is already controlled by {} {}",
                child.name.as_deref().unwrap_or("<unnamed>"),
                existing.kind,
                existing.name
            )));
        }
        return Ok(());
    }
    refs.push(link);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn owner(uid: Option<&str>) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("owner".into());
        cm.metadata.uid = uid.map(|s| s.to_string());
        cm
    }

    #[test]
    fn set_owner_links_once() {
        let mut meta = ObjectMeta { name: Some("child".into()), ..Default::default() };
        set_owner(&mut meta, &owner(Some("u-1"))).unwrap();
        set_owner(&mut meta, &owner(Some("u-1"))).unwrap();
        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "u-1");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn set_owner_rejects_second_controller_and_missing_uid() {
        let mut meta = ObjectMeta { name: Some("child".into()), ..Default::default() };
        assert!(set_owner(&mut meta, &owner(None)).is_err());
        set_owner(&mut meta, &owner(Some("u-1"))).unwrap();
        let err = set_owner(&mut meta, &owner(Some("u-2"))).unwrap_err();
        assert!(err.to_string().contains("already controlled"), "err={}", err);
    }
}
