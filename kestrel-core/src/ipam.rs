//! IP address management
//!
//! Two allocators behind one contract: a private allocator iterating a VPC's
//! CIDR in deterministic order (smallest free host part first, skipping the
//! network, gateway and broadcast addresses of the VPC and of each subnet),
//! and a public allocator drawing from the configured pool.
//!
//! Allocation rows live in the store under `/alloc/<scope>/<addr>` and are
//! mutated with compare-and-set, so a reserve can ride in the same batch as
//! the VM mutation that consumes it. Released rows stay in place; an address
//! only becomes reusable once its release grace period has elapsed.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{KestrelError, KestrelResult};
use crate::store::{keys, BatchOp, Expected, Store};
use crate::types::{first_host, AllocationStatus, IpAllocation, IpScope, Subnet, VmId, Vpc};

/// IP allocator over the store
pub struct Ipam {
    store: Arc<Store>,
    public_pool: parking_lot::RwLock<BTreeSet<Ipv4Addr>>,
    grace: Duration,
}

impl Ipam {
    pub fn new(store: Arc<Store>, public_pool: Vec<Ipv4Addr>, grace: Duration) -> Self {
        Self {
            store,
            public_pool: parking_lot::RwLock::new(public_pool.into_iter().collect()),
            grace,
        }
    }

    /// Add an address to the public pool at runtime (admin operation).
    pub fn add_public(&self, addr: Ipv4Addr) -> KestrelResult<()> {
        if !self.public_pool.write().insert(addr) {
            return Err(KestrelError::AlreadyExists {
                resource: format!("public ip {}", addr),
            });
        }
        Ok(())
    }

    /// Remove an address from the public pool. Refused while the address has
    /// a live allocation.
    pub fn remove_public(&self, addr: Ipv4Addr) -> KestrelResult<()> {
        if let Some((alloc, _)) = self
            .store
            .get_typed::<IpAllocation>(&keys::alloc(&IpScope::PublicPool, &addr))?
        {
            if alloc.status != AllocationStatus::Released {
                return Err(KestrelError::conflict(
                    format!("public ip {}", addr),
                    "address is still allocated",
                ));
            }
        }
        if !self.public_pool.write().remove(&addr) {
            return Err(KestrelError::not_found(format!("public ip {}", addr)));
        }
        Ok(())
    }

    /// Pool membership check for the API layer.
    pub fn is_public(&self, addr: &Ipv4Addr) -> bool {
        self.public_pool.read().contains(addr)
    }

    /// Pick a free address and build the reserve op without committing it.
    /// The caller includes the op in the batch that also writes the consuming
    /// entity, so a crash never leaves a half-allocated state.
    pub fn reserve(
        &self,
        scope: &IpScope,
        owner: Option<VmId>,
        hint: Option<Ipv4Addr>,
    ) -> KestrelResult<(Ipv4Addr, BatchOp)> {
        let address = self.pick_free(scope, hint)?;
        let expected = match self.existing(scope, &address)? {
            Some((_, rev)) => Expected::Rev(rev),
            None => Expected::Absent,
        };
        let row = IpAllocation {
            scope: scope.clone(),
            address,
            owner,
            status: AllocationStatus::Reserved,
            reserved_at: Utc::now(),
            released_at: None,
        };
        let op = BatchOp::put_typed(keys::alloc(scope, &address), &row, expected)?;
        Ok((address, op))
    }

    /// Pick a free address and build an op that writes it directly as
    /// `bound`. For flows where intent and attach are the same store commit
    /// (floating-IP attach), collapsing reserve+bind avoids a window where
    /// the row exists unbound.
    pub fn allocate_bound(
        &self,
        scope: &IpScope,
        owner: VmId,
        hint: Option<Ipv4Addr>,
    ) -> KestrelResult<(Ipv4Addr, BatchOp)> {
        let address = self.pick_free(scope, hint)?;
        let expected = match self.existing(scope, &address)? {
            Some((_, rev)) => Expected::Rev(rev),
            None => Expected::Absent,
        };
        let row = IpAllocation {
            scope: scope.clone(),
            address,
            owner: Some(owner),
            status: AllocationStatus::Bound,
            reserved_at: Utc::now(),
            released_at: None,
        };
        let op = BatchOp::put_typed(keys::alloc(scope, &address), &row, expected)?;
        Ok((address, op))
    }

    /// Re-secure a specific address for an owner whose persisted record
    /// still references it — the retry path after a rolled-back create
    /// released the reservation out from under the stored NIC. Succeeds
    /// when the row is absent, released (grace does not apply to the
    /// address's own owner), or already held by the same owner; any other
    /// holder is a conflict.
    pub fn reacquire(
        &self,
        scope: &IpScope,
        address: Ipv4Addr,
        owner: VmId,
    ) -> KestrelResult<()> {
        let key = keys::alloc(scope, &address);
        let fresh = |status| IpAllocation {
            scope: scope.clone(),
            address,
            owner: Some(owner),
            status,
            reserved_at: Utc::now(),
            released_at: None,
        };
        match self.store.get_typed::<IpAllocation>(&key)? {
            None => {
                self.store.put_typed(
                    &key,
                    &fresh(AllocationStatus::Reserved),
                    Expected::Absent,
                )?;
                Ok(())
            }
            Some((row, rev)) => match row.status {
                AllocationStatus::Reserved | AllocationStatus::Bound
                    if row.owner == Some(owner) =>
                {
                    Ok(())
                }
                AllocationStatus::Released => {
                    self.store.put_typed(
                        &key,
                        &fresh(AllocationStatus::Reserved),
                        Expected::Rev(rev),
                    )?;
                    Ok(())
                }
                _ => Err(KestrelError::conflict(
                    key,
                    format!("address {} is held by another owner", address),
                )),
            },
        }
    }

    /// Reserve and commit in one step, for callers with no surrounding batch.
    pub fn reserve_commit(
        &self,
        scope: &IpScope,
        owner: Option<VmId>,
        hint: Option<Ipv4Addr>,
    ) -> KestrelResult<Ipv4Addr> {
        let (address, op) = self.reserve(scope, owner, hint)?;
        self.store.batch(vec![op])?;
        Ok(address)
    }

    /// Mark a reserved address as bound to its owner. Re-binding the same
    /// owner is a no-op; anything else is a conflict.
    pub fn bind(&self, scope: &IpScope, address: Ipv4Addr, owner: VmId) -> KestrelResult<()> {
        let op = self.bind_op(scope, address, owner)?;
        if let Some(op) = op {
            self.store.batch(vec![op])?;
        }
        Ok(())
    }

    pub fn bind_op(
        &self,
        scope: &IpScope,
        address: Ipv4Addr,
        owner: VmId,
    ) -> KestrelResult<Option<BatchOp>> {
        let key = keys::alloc(scope, &address);
        let (mut row, rev) = self
            .store
            .get_typed::<IpAllocation>(&key)?
            .ok_or_else(|| KestrelError::not_found(key.clone()))?;
        match row.status {
            AllocationStatus::Bound if row.owner == Some(owner) => return Ok(None),
            AllocationStatus::Reserved => {}
            _ => {
                return Err(KestrelError::conflict(
                    key,
                    format!("address {} is not reservable for binding", address),
                ));
            }
        }
        if let Some(existing) = row.owner {
            if existing != owner {
                return Err(KestrelError::conflict(
                    key,
                    format!("address {} reserved by {}", address, existing),
                ));
            }
        }
        row.status = AllocationStatus::Bound;
        row.owner = Some(owner);
        Ok(Some(BatchOp::put_typed(key, &row, Expected::Rev(rev))?))
    }

    /// Release an address. Idempotent: releasing an absent or already
    /// released address succeeds. Releasing on behalf of the wrong owner is
    /// a conflict.
    pub fn release(
        &self,
        scope: &IpScope,
        address: Ipv4Addr,
        owner: Option<VmId>,
    ) -> KestrelResult<()> {
        if let Some(op) = self.release_op(scope, address, owner)? {
            self.store.batch(vec![op])?;
        }
        Ok(())
    }

    pub fn release_op(
        &self,
        scope: &IpScope,
        address: Ipv4Addr,
        owner: Option<VmId>,
    ) -> KestrelResult<Option<BatchOp>> {
        let key = keys::alloc(scope, &address);
        let Some((mut row, rev)) = self.store.get_typed::<IpAllocation>(&key)? else {
            return Ok(None);
        };
        if row.status == AllocationStatus::Released {
            return Ok(None);
        }
        if let (Some(want), Some(have)) = (owner, row.owner) {
            if want != have {
                return Err(KestrelError::conflict(
                    key,
                    format!("address {} owned by {}", address, have),
                ));
            }
        }
        row.status = AllocationStatus::Released;
        row.released_at = Some(Utc::now());
        Ok(Some(BatchOp::put_typed(key, &row, Expected::Rev(rev))?))
    }

    /// List all allocations under a scope, released rows included.
    pub fn list(&self, scope: &IpScope) -> KestrelResult<Vec<IpAllocation>> {
        Ok(self
            .store
            .list_typed::<IpAllocation>(&keys::alloc_scope_prefix(scope))?
            .into_iter()
            .map(|(row, _)| row)
            .collect())
    }

    /// Reap reserved allocations whose owner never materialized. Called by
    /// the background sweeper.
    pub fn reap_orphans(&self) -> KestrelResult<usize> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace)
            .map_err(|e| KestrelError::internal(format!("grace period out of range: {}", e)))?;
        let mut reaped = 0;
        for (key, data, rev) in self.store.list_prefix(keys::ALLOC_PREFIX)? {
            let mut row: IpAllocation = bincode::deserialize(&data)?;
            if row.status != AllocationStatus::Reserved {
                continue;
            }
            let orphaned = match row.owner {
                None => now - row.reserved_at > grace,
                Some(vm) => self.store.get(&keys::vm(&vm))?.is_none(),
            };
            if !orphaned {
                continue;
            }
            row.status = AllocationStatus::Released;
            row.released_at = Some(now);
            match self.store.put_typed(&key, &row, Expected::Rev(rev)) {
                Ok(_) => reaped += 1,
                // Lost a race with a bind; the next sweep re-evaluates.
                Err(KestrelError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "reaped orphaned ip reservations");
        }
        Ok(reaped)
    }

    fn existing(
        &self,
        scope: &IpScope,
        address: &Ipv4Addr,
    ) -> KestrelResult<Option<(IpAllocation, u64)>> {
        self.store.get_typed(&keys::alloc(scope, address))
    }

    /// Whether a store row leaves its address available for allocation.
    fn row_is_free(&self, row: &IpAllocation) -> bool {
        match row.status {
            AllocationStatus::Released => match row.released_at {
                Some(at) => match chrono::Duration::from_std(self.grace) {
                    Ok(grace) => Utc::now() - at >= grace,
                    Err(_) => false,
                },
                None => true,
            },
            _ => false,
        }
    }

    fn pick_free(&self, scope: &IpScope, hint: Option<Ipv4Addr>) -> KestrelResult<Ipv4Addr> {
        let candidates = self.candidates(scope)?;
        if let Some(wanted) = hint {
            if candidates.contains(&wanted) && self.addr_is_free(scope, &wanted)? {
                return Ok(wanted);
            }
        }
        for addr in candidates {
            if self.addr_is_free(scope, &addr)? {
                return Ok(addr);
            }
        }
        Err(KestrelError::Exhausted {
            resource: format!("ip scope {}", scope.key_fragment()),
        })
    }

    fn addr_is_free(&self, scope: &IpScope, addr: &Ipv4Addr) -> KestrelResult<bool> {
        Ok(match self.existing(scope, addr)? {
            None => true,
            Some((row, _)) => self.row_is_free(&row),
        })
    }

    /// Ordered candidate addresses for a scope, smallest host part first.
    fn candidates(&self, scope: &IpScope) -> KestrelResult<Vec<Ipv4Addr>> {
        match scope {
            IpScope::PublicPool => Ok(self.public_pool.read().iter().copied().collect()),
            IpScope::VpcPrivate(vpc_name) => {
                let (vpc, _) = self
                    .store
                    .get_typed::<Vpc>(&keys::vpc(vpc_name))?
                    .ok_or_else(|| KestrelError::not_found(format!("vpc {}", vpc_name)))?;
                let mut reserved: BTreeSet<Ipv4Addr> = BTreeSet::new();
                reserved.insert(vpc.cidr.network());
                reserved.insert(vpc.gateway);
                reserved.insert(vpc.cidr.broadcast());
                for subnet_id in &vpc.subnets {
                    if let Some((subnet, _)) =
                        self.store.get_typed::<Subnet>(&keys::subnet(subnet_id))?
                    {
                        reserved.insert(subnet.cidr.network());
                        reserved.insert(first_host(&subnet.cidr));
                        reserved.insert(subnet.cidr.broadcast());
                    }
                }
                Ok(vpc
                    .cidr
                    .hosts()
                    .filter(|addr| !reserved.contains(addr))
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use ipnet::Ipv4Net;
    use tempfile::tempdir;

    fn setup(grace: Duration) -> (tempfile::TempDir, Arc<Store>, Ipam) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("ipam.redb")).unwrap());
        let pool = vec![
            "203.0.113.10".parse().unwrap(),
            "203.0.113.11".parse().unwrap(),
        ];
        let ipam = Ipam::new(store.clone(), pool, grace);
        (dir, store, ipam)
    }

    fn seed_vpc(store: &Store, name: &str, cidr: &str) {
        let vpc = Vpc::new(name.to_string(), cidr.parse::<Ipv4Net>().unwrap(), 1500);
        store
            .put_typed(&keys::vpc(name), &vpc, Expected::Absent)
            .unwrap();
    }

    #[test]
    fn private_allocation_is_deterministic_smallest_first() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());

        // .0 network, .1 gateway, .255 broadcast are reserved.
        let a = ipam.reserve_commit(&scope, None, None).unwrap();
        assert_eq!(a, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        let b = ipam.reserve_commit(&scope, None, None).unwrap();
        assert_eq!(b, "10.0.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn hint_is_honored_when_free() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());

        let hinted = ipam
            .reserve_commit(&scope, None, Some("10.0.0.40".parse().unwrap()))
            .unwrap();
        assert_eq!(hinted, "10.0.0.40".parse::<Ipv4Addr>().unwrap());

        // A used hint falls back to deterministic order.
        let fallback = ipam
            .reserve_commit(&scope, None, Some("10.0.0.40".parse().unwrap()))
            .unwrap();
        assert_eq!(fallback, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn public_pool_exhausts_after_two_binds() {
        let (_dir, _store, ipam) = setup(Duration::from_secs(300));
        let scope = IpScope::PublicPool;
        let owner_a = VmId::new();
        let owner_b = VmId::new();

        let a = ipam.reserve_commit(&scope, Some(owner_a), None).unwrap();
        ipam.bind(&scope, a, owner_a).unwrap();
        let b = ipam.reserve_commit(&scope, Some(owner_b), None).unwrap();
        ipam.bind(&scope, b, owner_b).unwrap();

        let err = ipam.reserve_commit(&scope, None, None).unwrap_err();
        assert_eq!(err.code(), "exhausted");
    }

    #[test]
    fn no_two_live_rows_for_one_address() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/30");
        let scope = IpScope::VpcPrivate("v1".to_string());

        // /30: network .0, gateway .1, broadcast .3 leave exactly one host.
        let only = ipam.reserve_commit(&scope, None, None).unwrap();
        assert_eq!(only, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        let err = ipam.reserve_commit(&scope, None, None).unwrap_err();
        assert_eq!(err.code(), "exhausted");

        // Racing reserves of the same address collapse into one row: the
        // second batch fails its CAS.
        let (addr, op) = ipam.reserve(&IpScope::PublicPool, None, None).unwrap();
        let (addr2, op2) = ipam.reserve(&IpScope::PublicPool, None, None).unwrap();
        assert_eq!(addr, addr2);
        store.batch(vec![op]).unwrap();
        assert_eq!(store.batch(vec![op2]).unwrap_err().code(), "conflict");
    }

    #[test]
    fn release_is_idempotent_and_grace_gated() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());
        let owner = VmId::new();

        let addr = ipam.reserve_commit(&scope, Some(owner), None).unwrap();
        ipam.bind(&scope, addr, owner).unwrap();
        ipam.release(&scope, addr, Some(owner)).unwrap();
        ipam.release(&scope, addr, Some(owner)).unwrap();
        ipam.release(&scope, "10.0.0.99".parse().unwrap(), None).unwrap();

        // Inside the grace window the freed address is not handed out again.
        let next = ipam.reserve_commit(&scope, None, None).unwrap();
        assert_eq!(next, "10.0.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn released_address_reusable_after_grace() {
        let (_dir, store, ipam) = setup(Duration::from_secs(0));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());
        let owner = VmId::new();

        let addr = ipam.reserve_commit(&scope, Some(owner), None).unwrap();
        ipam.bind(&scope, addr, owner).unwrap();
        ipam.release(&scope, addr, Some(owner)).unwrap();

        // Zero grace: the smallest address comes straight back.
        let again = ipam.reserve_commit(&scope, None, None).unwrap();
        assert_eq!(again, addr);
    }

    #[test]
    fn bind_checks_ownership() {
        let (_dir, _store, ipam) = setup(Duration::from_secs(300));
        let scope = IpScope::PublicPool;
        let owner = VmId::new();
        let other = VmId::new();

        let addr = ipam.reserve_commit(&scope, Some(owner), None).unwrap();
        assert_eq!(ipam.bind(&scope, addr, other).unwrap_err().code(), "conflict");
        ipam.bind(&scope, addr, owner).unwrap();
        // Idempotent rebind by the same owner.
        ipam.bind(&scope, addr, owner).unwrap();
    }

    #[test]
    fn reacquire_restores_released_rows_for_their_owner() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());
        let owner = VmId::new();

        let addr = ipam.reserve_commit(&scope, Some(owner), None).unwrap();
        ipam.bind(&scope, addr, owner).unwrap();
        ipam.release(&scope, addr, Some(owner)).unwrap();

        // The grace period does not keep an owner from taking back its own
        // address.
        ipam.reacquire(&scope, addr, owner).unwrap();
        let rows = ipam.list(&scope).unwrap();
        let row = rows.iter().find(|r| r.address == addr).unwrap();
        assert_eq!(row.status, AllocationStatus::Reserved);
        assert_eq!(row.owner, Some(owner));

        // Idempotent while reserved, and again once bound.
        ipam.reacquire(&scope, addr, owner).unwrap();
        ipam.bind(&scope, addr, owner).unwrap();
        ipam.reacquire(&scope, addr, owner).unwrap();

        // A different owner cannot steal the live row.
        let thief = VmId::new();
        assert_eq!(
            ipam.reacquire(&scope, addr, thief).unwrap_err().code(),
            "conflict"
        );
    }

    #[test]
    fn reacquire_creates_the_row_when_absent() {
        let (_dir, store, ipam) = setup(Duration::from_secs(300));
        seed_vpc(&store, "v1", "10.0.0.0/24");
        let scope = IpScope::VpcPrivate("v1".to_string());
        let owner = VmId::new();

        let addr: Ipv4Addr = "10.0.0.7".parse().unwrap();
        ipam.reacquire(&scope, addr, owner).unwrap();
        let rows = ipam.list(&scope).unwrap();
        let row = rows.iter().find(|r| r.address == addr).unwrap();
        assert_eq!(row.status, AllocationStatus::Reserved);
        assert_eq!(row.owner, Some(owner));
    }

    #[test]
    fn reaper_releases_orphaned_reservations() {
        let (_dir, _store, ipam) = setup(Duration::from_secs(0));
        let scope = IpScope::PublicPool;
        let ghost = VmId::new();

        // Reservation owned by a VM that never landed in the store.
        let addr = ipam.reserve_commit(&scope, Some(ghost), None).unwrap();
        let reaped = ipam.reap_orphans().unwrap();
        assert_eq!(reaped, 1);

        let rows = ipam.list(&scope).unwrap();
        let row = rows.iter().find(|r| r.address == addr).unwrap();
        assert_eq!(row.status, AllocationStatus::Released);
    }

    #[test]
    fn public_pool_membership_guards() {
        let (_dir, _store, ipam) = setup(Duration::from_secs(300));
        let addr: Ipv4Addr = "203.0.113.12".parse().unwrap();
        ipam.add_public(addr).unwrap();
        assert_eq!(ipam.add_public(addr).unwrap_err().code(), "conflict");

        let owner = VmId::new();
        let got = ipam
            .reserve_commit(&IpScope::PublicPool, Some(owner), Some(addr))
            .unwrap();
        assert_eq!(got, addr);
        ipam.bind(&IpScope::PublicPool, addr, owner).unwrap();
        assert_eq!(ipam.remove_public(addr).unwrap_err().code(), "conflict");
    }
}
