use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_spans;
use super::{Engine, EngineError, SharedRental, SharedVehicle};

/// Listing filter for rental requests. With no status filter, terminal
/// (rejected/deleted) rows are excluded — the open-requests view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RentalFilter {
    pub renter_id: Option<Ulid>,
    pub status: Option<RentalStatus>,
}

fn validate_paging(page: usize, limit: usize) -> Result<(), EngineError> {
    if page == 0 {
        return Err(EngineError::InvalidInput("page starts at 1"));
    }
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(EngineError::InvalidInput("limit out of range"));
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, page: usize, limit: usize) -> Page<T> {
    let total = items.len();
    let total_pages = total.div_ceil(limit);
    let items = items.into_iter().skip((page - 1) * limit).take(limit).collect();
    Page {
        items,
        total,
        page,
        total_pages,
    }
}

impl Engine {
    // ── Rental & booking listings ────────────────────────────

    pub async fn get_rental(&self, id: Ulid) -> Result<RentalRequest, EngineError> {
        let rental = self.get_rental_arc(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rental.read().await;
        Ok(guard.clone())
    }

    /// Paginated rental requests ordered by id (ULIDs sort by submission
    /// time), `page` 1-based.
    pub async fn list_rentals(
        &self,
        filter: RentalFilter,
        page: usize,
        limit: usize,
    ) -> Result<Page<RentalRequest>, EngineError> {
        validate_paging(page, limit)?;

        let arcs: Vec<SharedRental> = self.rentals().iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            let keep = match filter.status {
                Some(wanted) => guard.status == wanted,
                None => guard.status == RentalStatus::Pending,
            };
            if !keep {
                continue;
            }
            if let Some(renter) = filter.renter_id
                && guard.renter_id != renter
            {
                continue;
            }
            rows.push(guard.clone());
        }
        rows.sort_by_key(|r| r.id);
        Ok(paginate(rows, page, limit))
    }

    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings()
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Paginated bookings, optionally restricted to one renter.
    pub fn list_bookings(
        &self,
        renter_id: Option<Ulid>,
        page: usize,
        limit: usize,
    ) -> Result<Page<Booking>, EngineError> {
        validate_paging(page, limit)?;

        let mut rows: Vec<Booking> = self
            .bookings()
            .iter()
            .filter(|b| renter_id.is_none_or(|r| b.renter_id == r))
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by_key(|b| b.id);
        Ok(paginate(rows, page, limit))
    }

    // ── Fleet listings ───────────────────────────────────────

    pub async fn get_vehicle_info(&self, id: Ulid) -> Result<VehicleInfo, EngineError> {
        let vehicle = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = vehicle.read().await;
        Ok(VehicleInfo {
            id: guard.id,
            org_id: guard.org_id.clone(),
            rates: guard.rates,
            attrs: guard.attrs.clone(),
        })
    }

    /// All vehicles, optionally one organization's fleet, ordered by id.
    pub async fn list_vehicles(&self, org_id: Option<&str>) -> Vec<VehicleInfo> {
        let arcs: Vec<SharedVehicle> = self.vehicles().iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            if let Some(org) = org_id
                && guard.org_id != org
            {
                continue;
            }
            rows.push(VehicleInfo {
                id: guard.id,
                org_id: guard.org_id.clone(),
                rates: guard.rates,
                attrs: guard.attrs.clone(),
            });
        }
        rows.sort_by_key(|v| v.id);
        rows
    }

    // ── Availability ─────────────────────────────────────────

    /// True iff no blocked interval overlaps `span`.
    pub async fn check_availability(
        &self,
        vehicle_id: Ulid,
        span: Span,
    ) -> Result<bool, EngineError> {
        let vehicle = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vehicle.read().await;
        Ok(guard.is_free(&span))
    }

    /// Free windows within `[start, end)`, ascending.
    pub async fn compute_free_spans(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let vehicle = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vehicle.read().await;
        let blocked: Vec<Span> = guard.blocked.iter().map(|b| b.span).collect();
        Ok(free_spans(&blocked, &Span::new(start, end)))
    }

    /// The vehicle's blocked intervals, ascending by start.
    pub async fn list_blocked(&self, vehicle_id: Ulid) -> Result<Vec<BlockedInfo>, EngineError> {
        let vehicle = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vehicle.read().await;
        Ok(guard
            .blocked
            .iter()
            .map(|b| BlockedInfo {
                vehicle_id,
                booking_id: b.booking_id,
                start: b.span.start,
                end: b.span.end,
            })
            .collect())
    }

    // ── Aggregates ───────────────────────────────────────────

    /// Counts and committed revenue. Revenue sums over bookings; retained
    /// rental requests (pending + terminal) are counted separately.
    pub fn analytics(&self) -> Analytics {
        let total_rentals = self.rentals().len();
        let total_bookings = self.bookings().len();

        let mut total_revenue_cents: Cents = 0;
        let mut per_vehicle: HashMap<Ulid, usize> = HashMap::new();
        for b in self.bookings().iter() {
            total_revenue_cents += b.total_price_cents;
            *per_vehicle.entry(b.vehicle_id).or_default() += 1;
        }

        let mut top_vehicles: Vec<(Ulid, usize)> = per_vehicle.into_iter().collect();
        top_vehicles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_vehicles.truncate(5);

        Analytics {
            total_rentals,
            total_bookings,
            total_revenue_cents,
            top_vehicles,
        }
    }
}
