use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::{Storage, StorageError, StoreResult, UnitOfWork};
use crate::Amount;
use crate::ledger::Wallet;
use crate::model::{
    BookingId, ExternalOrder, Location, LocationId, NewExternalOrder, NewRideBooking,
    NewWalletTransaction, OrderId, Ride, RideBooking, RideId, User, UserId, Vehicle, VehicleId,
    WalletTransaction,
};

const USERS_PKEY: &str = "users_pkey";
const WALLETS_PKEY: &str = "wallets_user_key";
const RIDES_PKEY: &str = "rides_pkey";
const LOCATIONS_PKEY: &str = "locations_pkey";
const VEHICLES_PKEY: &str = "vehicles_pkey";
const RIDE_USER_KEY: &str = "ride_bookings_ride_id_user_id_key";
const EXT_ORDER_KEY: &str = "external_orders_ext_order_id_key";

/// Versioned things a unit of work can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    User(UserId),
    Wallet(UserId),
    Ride(RideId),
    Booking(BookingId),
    /// The set of bookings on a ride (seat capacity, duplicates).
    RideBookings(RideId),
    /// The set of bookings of a user (one active ride at a time).
    UserBookings(UserId),
    Order(OrderId),
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    wallets: HashMap<UserId, Wallet>,
    rides: HashMap<RideId, Ride>,
    locations: HashMap<LocationId, Location>,
    vehicles: HashMap<VehicleId, Vehicle>,
    bookings: HashMap<BookingId, RideBooking>,
    ride_user: HashMap<(RideId, UserId), BookingId>,
    by_user: HashMap<UserId, Vec<BookingId>>,
    orders: HashMap<OrderId, ExternalOrder>,
    ext_orders: HashMap<String, OrderId>,
    ledger: Vec<WalletTransaction>,
    versions: HashMap<RowKey, u64>,
}

impl Tables {
    fn version(&self, key: &RowKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: RowKey) {
        *self.versions.entry(key).or_insert(0) += 1;
    }

    fn ride_bookings(&self, ride: RideId) -> impl Iterator<Item = &RideBooking> {
        self.bookings.values().filter(move |b| b.ride == ride)
    }

    fn user_bookings(&self, user: UserId) -> impl Iterator<Item = &RideBooking> {
        self.by_user
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bookings.get(id))
    }
}

/// In-process store with optimistic concurrency control.
///
/// Units of work read committed rows under a short lock and remember the
/// version of everything they read. Writes stay in the unit until commit,
/// which takes the lock once, checks every remembered version, enforces
/// unique keys and applies all writes together. Intended for tests, the
/// replay binary and embedding.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    booking_seq: AtomicU64,
    ledger_seq: AtomicU64,
    order_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            booking_seq: AtomicU64::new(1),
            ledger_seq: AtomicU64::new(1),
            order_seq: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Committed wallets ordered by user id.
    pub fn wallets(&self) -> StoreResult<Vec<Wallet>> {
        let tables = self.lock()?;
        let mut wallets: Vec<Wallet> = tables.wallets.values().cloned().collect();
        wallets.sort_by_key(Wallet::user);
        Ok(wallets)
    }

    /// Committed users ordered by id.
    pub fn users(&self) -> StoreResult<Vec<User>> {
        let tables = self.lock()?;
        let mut users: Vec<User> = tables.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    /// Number of committed ledger entries.
    pub fn ledger_len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.ledger.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut tx = MemoryTx::new(self);
        // dropping `tx` on error discards every buffered write
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// A buffered write and whether it creates the row.
#[derive(Debug)]
struct Pending<T> {
    row: T,
    inserted: bool,
}

fn stage<K: Hash + Eq, T>(map: &mut HashMap<K, Pending<T>>, key: K, row: T, inserted: bool) {
    match map.entry(key) {
        Entry::Occupied(mut entry) => entry.get_mut().row = row,
        Entry::Vacant(entry) => {
            entry.insert(Pending { row, inserted });
        }
    }
}

/// One open unit of work against a [`MemoryStore`].
struct MemoryTx<'a> {
    store: &'a MemoryStore,
    reads: HashMap<RowKey, u64>,
    users: HashMap<UserId, Pending<User>>,
    wallets: HashMap<UserId, Pending<Wallet>>,
    rides: HashMap<RideId, Pending<Ride>>,
    locations: HashMap<LocationId, Location>,
    vehicles: HashMap<VehicleId, Vehicle>,
    bookings: HashMap<BookingId, Pending<RideBooking>>,
    orders: HashMap<OrderId, Pending<ExternalOrder>>,
    ledger: Vec<WalletTransaction>,
}

impl<'a> MemoryTx<'a> {
    fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            users: HashMap::new(),
            wallets: HashMap::new(),
            rides: HashMap::new(),
            locations: HashMap::new(),
            vehicles: HashMap::new(),
            bookings: HashMap::new(),
            orders: HashMap::new(),
            ledger: Vec::new(),
        }
    }

    /// Read committed state and remember the version of `key`. The first
    /// observed version wins, so a row that moved mid-unit fails the commit.
    fn observe<T>(&mut self, key: RowKey, read: impl FnOnce(&Tables) -> T) -> StoreResult<T> {
        let store = self.store;
        let tables = store.lock()?;
        let version = tables.version(&key);
        let value = read(&tables);
        drop(tables);
        self.reads.entry(key).or_insert(version);
        Ok(value)
    }

    /// Read committed state without registering a version (immutable rows).
    fn committed<T>(&self, read: impl FnOnce(&Tables) -> T) -> StoreResult<T> {
        let store = self.store;
        let tables = store.lock()?;
        Ok(read(&tables))
    }

    fn commit(self) -> StoreResult<()> {
        let store = self.store;
        let mut tables = store.lock()?;

        if let Some((key, _)) = self
            .reads
            .iter()
            .find(|(key, seen)| tables.version(key) != **seen)
        {
            debug!(?key, "row changed since it was read");
            return Err(StorageError::Conflict);
        }

        if self
            .users
            .iter()
            .any(|(id, p)| p.inserted && tables.users.contains_key(id))
        {
            return Err(StorageError::UniqueViolation(USERS_PKEY));
        }
        if self
            .wallets
            .iter()
            .any(|(id, p)| p.inserted && tables.wallets.contains_key(id))
        {
            return Err(StorageError::UniqueViolation(WALLETS_PKEY));
        }
        if self
            .rides
            .iter()
            .any(|(id, p)| p.inserted && tables.rides.contains_key(id))
        {
            return Err(StorageError::UniqueViolation(RIDES_PKEY));
        }
        if self.locations.keys().any(|id| tables.locations.contains_key(id)) {
            return Err(StorageError::UniqueViolation(LOCATIONS_PKEY));
        }
        if self.vehicles.keys().any(|id| tables.vehicles.contains_key(id)) {
            return Err(StorageError::UniqueViolation(VEHICLES_PKEY));
        }
        if self.bookings.values().any(|p| {
            p.inserted && tables.ride_user.contains_key(&(p.row.ride, p.row.user))
        }) {
            return Err(StorageError::UniqueViolation(RIDE_USER_KEY));
        }
        if self
            .orders
            .values()
            .any(|p| p.inserted && tables.ext_orders.contains_key(&p.row.ext_order_id))
        {
            return Err(StorageError::UniqueViolation(EXT_ORDER_KEY));
        }

        for (id, pending) in self.users {
            tables.users.insert(id, pending.row);
            tables.bump(RowKey::User(id));
        }
        for (id, pending) in self.wallets {
            tables.wallets.insert(id, pending.row);
            tables.bump(RowKey::Wallet(id));
        }
        for (id, pending) in self.rides {
            tables.rides.insert(id, pending.row);
            tables.bump(RowKey::Ride(id));
        }
        tables.locations.extend(self.locations);
        tables.vehicles.extend(self.vehicles);
        for (id, pending) in self.bookings {
            let booking = pending.row;
            if pending.inserted {
                tables.ride_user.insert((booking.ride, booking.user), id);
                tables.by_user.entry(booking.user).or_default().push(id);
            }
            tables.bump(RowKey::Booking(id));
            tables.bump(RowKey::RideBookings(booking.ride));
            tables.bump(RowKey::UserBookings(booking.user));
            tables.bookings.insert(id, booking);
        }
        for (id, pending) in self.orders {
            if pending.inserted {
                tables.ext_orders.insert(pending.row.ext_order_id.clone(), id);
            }
            tables.orders.insert(id, pending.row);
            tables.bump(RowKey::Order(id));
        }
        tables.ledger.extend(self.ledger);

        Ok(())
    }
}

impl UnitOfWork for MemoryTx<'_> {
    fn user(&mut self, id: UserId) -> StoreResult<Option<User>> {
        if let Some(pending) = self.users.get(&id) {
            return Ok(Some(pending.row.clone()));
        }
        self.observe(RowKey::User(id), |t| t.users.get(&id).cloned())
    }

    fn insert_user(&mut self, user: User) -> StoreResult<()> {
        let id = user.id;
        if self.users.contains_key(&id) || self.committed(|t| t.users.contains_key(&id))? {
            return Err(StorageError::UniqueViolation(USERS_PKEY));
        }
        stage(&mut self.users, id, user, true);
        Ok(())
    }

    fn update_user(&mut self, user: User) -> StoreResult<()> {
        let id = user.id;
        if !self.users.contains_key(&id)
            && !self.observe(RowKey::User(id), |t| t.users.contains_key(&id))?
        {
            return Err(StorageError::RowMissing("user", id));
        }
        stage(&mut self.users, id, user, false);
        Ok(())
    }

    fn wallet(&mut self, user: UserId) -> StoreResult<Option<Wallet>> {
        if let Some(pending) = self.wallets.get(&user) {
            return Ok(Some(pending.row.clone()));
        }
        self.observe(RowKey::Wallet(user), |t| t.wallets.get(&user).cloned())
    }

    fn insert_wallet(&mut self, wallet: Wallet) -> StoreResult<()> {
        let user = wallet.user();
        if self.wallets.contains_key(&user) || self.committed(|t| t.wallets.contains_key(&user))? {
            return Err(StorageError::UniqueViolation(WALLETS_PKEY));
        }
        stage(&mut self.wallets, user, wallet, true);
        Ok(())
    }

    fn update_wallet(&mut self, wallet: Wallet) -> StoreResult<()> {
        let user = wallet.user();
        if !self.wallets.contains_key(&user)
            && !self.observe(RowKey::Wallet(user), |t| t.wallets.contains_key(&user))?
        {
            return Err(StorageError::RowMissing("wallet", user));
        }
        stage(&mut self.wallets, user, wallet, false);
        Ok(())
    }

    fn append_transaction(
        &mut self,
        entry: NewWalletTransaction,
    ) -> StoreResult<WalletTransaction> {
        let id = self.store.ledger_seq.fetch_add(1, Ordering::Relaxed);
        let row = WalletTransaction {
            id,
            user: entry.user,
            direction: entry.direction,
            purpose: entry.purpose,
            amount: entry.amount,
            ride: entry.ride,
            booking: entry.booking,
            external_order: entry.external_order,
            description: entry.description,
            created_at: entry.created_at,
        };
        self.ledger.push(row.clone());
        Ok(row)
    }

    fn transactions(
        &mut self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<WalletTransaction>> {
        let mut rows = self.committed(|t| {
            t.ledger
                .iter()
                .filter(|entry| entry.user == user)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.extend(self.ledger.iter().filter(|e| e.user == user).cloned());
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn ride(&mut self, id: RideId) -> StoreResult<Option<Ride>> {
        if let Some(pending) = self.rides.get(&id) {
            return Ok(Some(pending.row.clone()));
        }
        self.observe(RowKey::Ride(id), |t| t.rides.get(&id).cloned())
    }

    fn insert_ride(&mut self, ride: Ride) -> StoreResult<()> {
        let id = ride.id;
        if self.rides.contains_key(&id) || self.committed(|t| t.rides.contains_key(&id))? {
            return Err(StorageError::UniqueViolation(RIDES_PKEY));
        }
        stage(&mut self.rides, id, ride, true);
        Ok(())
    }

    fn update_ride(&mut self, ride: Ride) -> StoreResult<()> {
        let id = ride.id;
        if !self.rides.contains_key(&id)
            && !self.observe(RowKey::Ride(id), |t| t.rides.contains_key(&id))?
        {
            return Err(StorageError::RowMissing("ride", id));
        }
        stage(&mut self.rides, id, ride, false);
        Ok(())
    }

    fn location(&mut self, id: LocationId) -> StoreResult<Option<Location>> {
        if let Some(location) = self.locations.get(&id) {
            return Ok(Some(location.clone()));
        }
        self.committed(|t| t.locations.get(&id).cloned())
    }

    fn insert_location(&mut self, location: Location) -> StoreResult<()> {
        let id = location.id;
        if self.locations.contains_key(&id) || self.committed(|t| t.locations.contains_key(&id))? {
            return Err(StorageError::UniqueViolation(LOCATIONS_PKEY));
        }
        self.locations.insert(id, location);
        Ok(())
    }

    fn vehicle(&mut self, id: VehicleId) -> StoreResult<Option<Vehicle>> {
        if let Some(vehicle) = self.vehicles.get(&id) {
            return Ok(Some(vehicle.clone()));
        }
        self.committed(|t| t.vehicles.get(&id).cloned())
    }

    fn insert_vehicle(&mut self, vehicle: Vehicle) -> StoreResult<()> {
        let id = vehicle.id;
        if self.vehicles.contains_key(&id) || self.committed(|t| t.vehicles.contains_key(&id))? {
            return Err(StorageError::UniqueViolation(VEHICLES_PKEY));
        }
        self.vehicles.insert(id, vehicle);
        Ok(())
    }

    fn booking(&mut self, id: BookingId) -> StoreResult<Option<RideBooking>> {
        if let Some(pending) = self.bookings.get(&id) {
            return Ok(Some(pending.row.clone()));
        }
        self.observe(RowKey::Booking(id), |t| t.bookings.get(&id).cloned())
    }

    fn bookings_for_ride(&mut self, ride: RideId) -> StoreResult<Vec<RideBooking>> {
        let mut rows: BTreeMap<BookingId, RideBooking> =
            self.observe(RowKey::RideBookings(ride), |t| {
                t.ride_bookings(ride).map(|b| (b.id, b.clone())).collect()
            })?;
        for pending in self.bookings.values().filter(|p| p.row.ride == ride) {
            rows.insert(pending.row.id, pending.row.clone());
        }
        Ok(rows.into_values().collect())
    }

    fn bookings_for_user(&mut self, user: UserId) -> StoreResult<Vec<RideBooking>> {
        let mut rows: BTreeMap<BookingId, RideBooking> =
            self.observe(RowKey::UserBookings(user), |t| {
                t.user_bookings(user).map(|b| (b.id, b.clone())).collect()
            })?;
        for pending in self.bookings.values().filter(|p| p.row.user == user) {
            rows.insert(pending.row.id, pending.row.clone());
        }
        Ok(rows.into_values().collect())
    }

    fn insert_booking(&mut self, booking: NewRideBooking) -> StoreResult<RideBooking> {
        let key = (booking.ride, booking.user);
        let buffered = self
            .bookings
            .values()
            .any(|p| (p.row.ride, p.row.user) == key);
        if buffered || self.committed(|t| t.ride_user.contains_key(&key))? {
            return Err(StorageError::UniqueViolation(RIDE_USER_KEY));
        }

        let id = self.store.booking_seq.fetch_add(1, Ordering::Relaxed);
        let row = RideBooking {
            id,
            ride: booking.ride,
            user: booking.user,
            status: booking.status,
            carbon_cost: booking.carbon_cost,
            ce_points_earned: Amount::ZERO,
            created_at: booking.created_at,
        };
        stage(&mut self.bookings, id, row.clone(), true);
        Ok(row)
    }

    fn update_booking(&mut self, booking: RideBooking) -> StoreResult<()> {
        let id = booking.id;
        if !self.bookings.contains_key(&id)
            && !self.observe(RowKey::Booking(id), |t| t.bookings.contains_key(&id))?
        {
            return Err(StorageError::RowMissing("ride booking", id));
        }
        stage(&mut self.bookings, id, booking, false);
        Ok(())
    }

    fn external_order(&mut self, id: OrderId) -> StoreResult<Option<ExternalOrder>> {
        if let Some(pending) = self.orders.get(&id) {
            return Ok(Some(pending.row.clone()));
        }
        self.observe(RowKey::Order(id), |t| t.orders.get(&id).cloned())
    }

    fn insert_external_order(&mut self, order: NewExternalOrder) -> StoreResult<ExternalOrder> {
        let buffered = self
            .orders
            .values()
            .any(|p| p.row.ext_order_id == order.ext_order_id);
        if buffered || self.committed(|t| t.ext_orders.contains_key(&order.ext_order_id))? {
            return Err(StorageError::UniqueViolation(EXT_ORDER_KEY));
        }

        let id = self.store.order_seq.fetch_add(1, Ordering::Relaxed);
        let row = ExternalOrder {
            id,
            user: order.user,
            ext_order_id: order.ext_order_id,
            amount: order.amount,
            coin_amount: order.coin_amount,
            conversion_rate: order.conversion_rate,
            status: order.status,
            created_at: order.created_at,
        };
        stage(&mut self.orders, id, row.clone(), true);
        Ok(row)
    }

    fn update_external_order(&mut self, order: ExternalOrder) -> StoreResult<()> {
        let id = order.id;
        if !self.orders.contains_key(&id)
            && !self.observe(RowKey::Order(id), |t| t.orders.contains_key(&id))?
        {
            return Err(StorageError::RowMissing("external order", id));
        }
        stage(&mut self.orders, id, order, false);
        Ok(())
    }
}
