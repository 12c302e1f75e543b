use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Amounts are integer cents.
pub type Cents = i64;

/// Half-open date interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Two half-open intervals `[a,b)` and `[c,d)` overlap iff `a < d && c < b`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Per-vehicle rate card. Weekly/monthly rates are carried for display;
/// billing is per-day (see `engine::pricing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCard {
    pub daily_cents: Cents,
    pub weekly_cents: Option<Cents>,
    pub monthly_cents: Option<Cents>,
}

impl RateCard {
    pub fn daily(daily_cents: Cents) -> Self {
        Self {
            daily_cents,
            weekly_cents: None,
            monthly_cents: None,
        }
    }
}

/// Free-form vehicle attributes, owned by the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleAttrs {
    pub model: String,
    pub location: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

/// A committed unavailability window on a vehicle, backed by a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocked {
    pub booking_id: Ulid,
    pub span: Span,
}

/// One vehicle's calendar state. Lives behind `Arc<RwLock<_>>`; the blocked
/// set is mutated only while holding the write lock, which is what keeps
/// conflict-check-then-insert atomic per vehicle.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub id: Ulid,
    pub org_id: String,
    pub rates: RateCard,
    pub attrs: VehicleAttrs,
    /// Blocked intervals, sorted by `span.start`, pairwise non-overlapping.
    pub blocked: Vec<Blocked>,
}

impl VehicleState {
    pub fn new(id: Ulid, org_id: String, rates: RateCard, attrs: VehicleAttrs) -> Self {
        Self {
            id,
            org_id,
            rates,
            attrs,
            blocked: Vec::new(),
        }
    }

    /// Insert a blocked interval maintaining sort order by span.start.
    /// Callers must have verified `is_free` under the same write lock.
    pub fn insert_blocked(&mut self, blocked: Blocked) {
        let pos = self
            .blocked
            .binary_search_by_key(&blocked.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.blocked.insert(pos, blocked);
    }

    /// Blocked intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Blocked> {
        let right_bound = self.blocked.partition_point(|b| b.span.start < query.end);
        self.blocked[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// True iff `span` does not overlap any blocked interval.
    pub fn is_free(&self, span: &Span) -> bool {
        self.overlapping(span).next().is_none()
    }

    /// The first blocked interval overlapping `span`, if any.
    pub fn first_conflict(&self, span: &Span) -> Option<&Blocked> {
        self.overlapping(span).next()
    }
}

/// Lifecycle state of a rental request. There is no stored `approved` state:
/// approval consumes the request inside the approval transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalStatus {
    Pending,
    Rejected,
    Deleted,
}

impl RentalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RentalStatus::Pending => "pending",
            RentalStatus::Rejected => "rejected",
            RentalStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RentalStatus::Pending),
            "rejected" => Some(RentalStatus::Rejected),
            "deleted" => Some(RentalStatus::Deleted),
            _ => None,
        }
    }
}

/// A renter's not-yet-decided ask to rent a vehicle for a date range.
/// The price is fixed at submission and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_id: Ulid,
    pub span: Span,
    pub status: RentalStatus,
    pub total_price_cents: Cents,
    pub reason: Option<String>,
    pub submitted_at: Ms,
    pub decided_at: Option<Ms>,
}

/// The immutable, committed rental outcome. Created only by the approval
/// transaction; `rental_id` is a historical reference — the request itself
/// is gone once the booking exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub rental_id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_id: Ulid,
    pub span: Span,
    pub total_price_cents: Cents,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub created_at: Ms,
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// `RentalApproved` is self-contained: one record captures the whole atomic
/// transition (vehicle blocked + booking created + request consumed), so
/// replay can never observe a partial commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleAdded {
        id: Ulid,
        org_id: String,
        rates: RateCard,
        attrs: VehicleAttrs,
    },
    VehicleUpdated {
        id: Ulid,
        rates: RateCard,
        attrs: VehicleAttrs,
    },
    VehicleRemoved {
        id: Ulid,
    },
    RentalSubmitted {
        id: Ulid,
        vehicle_id: Ulid,
        renter_id: Ulid,
        span: Span,
        total_price_cents: Cents,
        submitted_at: Ms,
    },
    RentalRejected {
        id: Ulid,
        reason: Option<String>,
        decided_at: Ms,
    },
    RentalDeleted {
        id: Ulid,
        decided_at: Ms,
    },
    RentalApproved {
        booking_id: Ulid,
        rental_id: Ulid,
        vehicle_id: Ulid,
        renter_id: Ulid,
        span: Span,
        total_price_cents: Cents,
        pickup_address: String,
        dropoff_address: String,
        approved_at: Ms,
    },
}

impl Event {
    /// The vehicle whose calendar this event concerns, if any.
    pub fn vehicle_id(&self) -> Option<Ulid> {
        match self {
            Event::VehicleAdded { id, .. }
            | Event::VehicleUpdated { id, .. }
            | Event::VehicleRemoved { id } => Some(*id),
            Event::RentalSubmitted { vehicle_id, .. }
            | Event::RentalApproved { vehicle_id, .. } => Some(*vehicle_id),
            Event::RentalRejected { .. } | Event::RentalDeleted { .. } => None,
        }
    }
}

/// Partial vehicle update from the organization's management surface.
/// Outer `None` = leave unchanged; inner `None` (for nullable fields) = clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehiclePatch {
    pub daily_cents: Option<Cents>,
    pub weekly_cents: Option<Option<Cents>>,
    pub monthly_cents: Option<Option<Cents>>,
    pub model: Option<String>,
    pub location: Option<String>,
    pub category: Option<Option<String>>,
    pub image_url: Option<Option<String>>,
}

impl VehiclePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub org_id: String,
    pub rates: RateCard,
    pub attrs: VehicleAttrs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedInfo {
    pub vehicle_id: Ulid,
    pub booking_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// One page of a listing, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analytics {
    pub total_rentals: usize,
    pub total_bookings: usize,
    pub total_revenue_cents: Cents,
    /// Most-booked vehicles, descending by booking count, at most five.
    pub top_vehicles: Vec<(Ulid, usize)>,
}
