/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `fchannel_realm` (`original_source/kernel/kernel-include/ferro/core/channels.h`):
//! a named-lookup namespace of published servers, not described by `spec.md`
//! but required to resolve a server name to a [`ChannelServer`] (see
//! `SPEC_FULL.md`'s supplemented features).

use alloc::{collections::BTreeMap, string::String, sync::Arc};

use machine::sync::IrqSafeSpinLock;

use crate::error::Status;

use super::ChannelServer;

/// A namespace of published server channels, optionally rooted in a parent
/// realm: a lookup that misses locally falls back to the parent, and so on
/// up the chain, matching `fchannel_realm_new`'s "child realm" framing.
pub struct Realm {
    parent: Option<Arc<Realm>>,
    published: IrqSafeSpinLock<BTreeMap<String, Arc<ChannelServer>>>,
}

impl Realm {
    /// `fchannel_realm_new(parent)`.
    pub fn new(parent: Option<Arc<Realm>>) -> Arc<Self> {
        Arc::new(Self { parent, published: IrqSafeSpinLock::new(BTreeMap::new()) })
    }

    /// `fchannel_realm_publish(realm, name, server)`.
    pub fn publish(&self, name: String, server: Arc<ChannelServer>) -> Result<(), Status> {
        let mut published = self.published.lock();
        if published.contains_key(&name) {
            return Err(Status::AlreadyInProgress);
        }
        published.insert(name, server);
        Ok(())
    }

    /// `fchannel_realm_unpublish(realm, name)`.
    pub fn unpublish(&self, name: &str) -> Result<(), Status> {
        self.published.lock().remove(name).map(|_| ()).ok_or(Status::NoSuchResource)
    }

    /// `fchannel_realm_lookup(realm, name) → server`. Falls back to the
    /// parent realm, and its parent, when `name` isn't published locally.
    pub fn lookup(&self, name: &str) -> Result<Arc<ChannelServer>, Status> {
        if let Some(server) = self.published.lock().get(name).cloned() {
            return Ok(server);
        }
        match &self.parent {
            Some(parent) => parent.lookup(name),
            None => Err(Status::NoSuchResource),
        }
    }
}

static GLOBAL: IrqSafeSpinLock<Option<Arc<Realm>>> = IrqSafeSpinLock::new(None);

/// `fchannel_realm_global()`: the root realm, created lazily on first use.
pub fn global() -> Arc<Realm> {
    let mut slot = GLOBAL.lock();
    if let Some(realm) = slot.as_ref() {
        return realm.clone();
    }
    let realm = Realm::new(None);
    *slot = Some(realm.clone());
    realm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_lookup_finds_the_server() {
        let realm = Realm::new(None);
        let server = ChannelServer::new();
        realm.publish(String::from("fs"), server).unwrap();
        assert!(realm.lookup("fs").is_ok());
    }

    #[test]
    fn republishing_the_same_name_fails() {
        let realm = Realm::new(None);
        realm.publish(String::from("fs"), ChannelServer::new()).unwrap();
        assert_eq!(realm.publish(String::from("fs"), ChannelServer::new()), Err(Status::AlreadyInProgress));
    }

    #[test]
    fn unpublish_then_lookup_reports_no_such_resource() {
        let realm = Realm::new(None);
        realm.publish(String::from("fs"), ChannelServer::new()).unwrap();
        realm.unpublish("fs").unwrap();
        assert_eq!(realm.lookup("fs").err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn global_realm_is_a_singleton() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_falls_back_to_parent_realm() {
        let root = Realm::new(None);
        root.publish(String::from("fs"), ChannelServer::new()).unwrap();
        let child = Realm::new(Some(root.clone()));
        assert!(child.lookup("fs").is_ok());
    }

    #[test]
    fn lookup_prefers_local_publish_over_parent() {
        let root = Realm::new(None);
        let root_server = ChannelServer::new();
        root.publish(String::from("fs"), root_server.clone()).unwrap();
        let child = Realm::new(Some(root.clone()));
        let child_server = ChannelServer::new();
        child.publish(String::from("fs"), child_server.clone()).unwrap();
        let found = child.lookup("fs").unwrap();
        assert!(Arc::ptr_eq(&found, &child_server));
        assert!(!Arc::ptr_eq(&found, &root_server));
    }

    #[test]
    fn lookup_misses_when_no_realm_in_chain_publishes_the_name() {
        let root = Realm::new(None);
        let child = Realm::new(Some(root));
        assert_eq!(child.lookup("fs").err(), Some(Status::NoSuchResource));
    }
}
