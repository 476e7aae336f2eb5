//! Runtime resource administration

use crate::server::Server;
use datagrid_common::{ClientConnection, ResourceInfo, ResourceStatus, Result};
use tracing::info;

impl Server {
    /// Mark a resource up or down; down resources vote zero
    pub fn set_resource_status(&self, name: &str, status: ResourceStatus) -> Result<()> {
        self.tree.set_status(name, status)
    }

    pub fn resource_info(&self, name: &str) -> Result<ResourceInfo> {
        self.tree.info(name)
    }

    /// Every configured resource, roots first
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> = self
            .tree
            .iter()
            .filter_map(|node| self.tree.info(node.name()).ok())
            .collect();
        infos.sort_by(|a, b| {
            a.parent
                .is_some()
                .cmp(&b.parent.is_some())
                .then_with(|| a.name.cmp(&b.name))
        });
        infos
    }

    /// Repair cached state of a resource and everything below it
    pub fn rebalance(&self, comm: &ClientConnection, name: &str) -> Result<()> {
        self.tree.rebalance(comm, name)?;
        info!("Rebalanced resource {}", name);
        Ok(())
    }

    /// Descriptors in use and the number that can be open at once
    #[must_use]
    pub fn descriptor_usage(&self) -> (usize, usize) {
        (self.descriptors.in_use(), self.descriptors.usable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, round_robin_server, single_resource};
    use datagrid_common::{Error, ResourcePropertyStore};
    use datagrid_resource::roundrobin::NEXT_CHILD_PROP;

    #[test]
    fn test_down_resource_refuses_create() {
        let (_dir, server) = single_resource();
        server.set_resource_status("disk", ResourceStatus::Down).unwrap();
        assert_eq!(server.resource_info("disk").unwrap().status, ResourceStatus::Down);
        assert!(server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f").with_resource("disk"))
            .is_err());

        server.set_resource_status("disk", ResourceStatus::Up).unwrap();
        let handle = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f").with_resource("disk"))
            .unwrap();
        server.close(&comm(), handle).unwrap();
    }

    #[test]
    fn test_unknown_resource() {
        let (_dir, server) = single_resource();
        assert!(matches!(
            server.set_resource_status("nope", ResourceStatus::Down),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_rebalance_repairs_round_robin_pointer() {
        let (_dir, server) = round_robin_server();
        let store: &dyn ResourcePropertyStore = server.catalog();
        assert!(store
            .compare_and_set_property("rr", NEXT_CHILD_PROP, Some("rr0"), "retired")
            .unwrap());

        server.rebalance(&comm(), "rr").unwrap();
        assert_eq!(
            store.get_property("rr", NEXT_CHILD_PROP).unwrap().as_deref(),
            Some("rr0")
        );
        // a second pass changes nothing
        server.rebalance(&comm(), "rr").unwrap();
        assert_eq!(
            store.get_property("rr", NEXT_CHILD_PROP).unwrap().as_deref(),
            Some("rr0")
        );
    }

    #[test]
    fn test_list_resources_roots_first() {
        let (_dir, server) = round_robin_server();
        let names: Vec<String> = server.list_resources().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["rr", "rr0", "rr1"]);
    }

    #[test]
    fn test_descriptor_usage() {
        let (_dir, server) = single_resource();
        let (in_use, usable) = server.descriptor_usage();
        assert_eq!(in_use, 0);
        assert_eq!(usable, server.config().descriptors.capacity - 3);
    }
}
