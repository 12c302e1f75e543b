use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use hyra::tenant::TenantManager;
use hyra::wire;

const D: i64 = 86_400_000;
/// 2024-01-01T00:00:00Z
const T0: i64 = 1_704_067_200_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("hyra_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "hyra".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("hyra")
        .password("hyra");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_db(addr, &format!("test_{}", Ulid::new())).await
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_vehicle(client: &tokio_postgres::Client, daily_rate: i64) -> Ulid {
    let vid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, org_id, model, daily_rate, location) \
             VALUES ('{vid}', '556000-1234', 'Volvo V60', {daily_rate}, 'Stockholm')"
        ))
        .await
        .unwrap();
    vid
}

async fn submit_rental(
    client: &tokio_postgres::Client,
    vehicle_id: Ulid,
    renter_id: Ulid,
    start: i64,
    end: i64,
) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rentals (id, vehicle_id, renter_id, start, \"end\") \
             VALUES ('{rid}', '{vehicle_id}', '{renter_id}', {start}, {end})"
        ))
        .await
        .unwrap();
    rid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn submit_creates_priced_pending_request() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let renter = Ulid::new();
    let rid = submit_rental(&client, vid, renter, T0, T0 + 3 * D).await;

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM rentals WHERE id = '{rid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get(0), Some(rid.to_string().as_str()));
    assert_eq!(row.get(5), Some("pending"));
    // Three whole days at 10 000.
    assert_eq!(row.get(6), Some("30000"));
    assert_eq!(row.get(7), None); // no rejection reason
}

#[tokio::test]
async fn full_approval_flow_with_conflict() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let renter = Ulid::new();

    // Submit for [Jan 1, Jan 4) and approve.
    let rid = submit_rental(&client, vid, renter, T0, T0 + 3 * D).await;
    let bid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO bookings (id, rental_id) VALUES ('{bid}', '{rid}')"))
        .await
        .unwrap();

    // Booking exists with the copied data and default addresses.
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE renter_id = '{renter}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(bid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some(rid.to_string().as_str()));
    assert_eq!(rows[0].get(6), Some("30000"));
    assert_eq!(rows[0].get(7), Some("Default Pickup Address"));
    assert_eq!(rows[0].get(8), Some("Default Dropoff Address"));

    // The request was consumed by the approval.
    let err = client
        .simple_query(&format!("SELECT * FROM rentals WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    // The vehicle's calendar is blocked for [Jan 1, Jan 4).
    let blocked = data_rows(
        client
            .simple_query(&format!("SELECT * FROM blocked WHERE vehicle_id = '{vid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].get(2), Some(T0.to_string().as_str()));
    assert_eq!(blocked[0].get(3), Some((T0 + 3 * D).to_string().as_str()));

    // Submitting over the blocked window still succeeds (no check at creation)...
    let overlap = submit_rental(&client, vid, renter, T0 + D, T0 + 2 * D).await;
    // ...but approving it must fail with a conflict, leaving it pending.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{overlap}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("conflict"));

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM rentals WHERE id = '{overlap}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get(5), Some("pending"));

    // Still exactly one blocked interval.
    let blocked = data_rows(
        client
            .simple_query(&format!("SELECT * FROM blocked WHERE vehicle_id = '{vid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(blocked.len(), 1);
}

#[tokio::test]
async fn approval_with_explicit_addresses() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let rid = submit_rental(&client, vid, Ulid::new(), T0, T0 + D).await;
    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id, pickup_address, dropoff_address) \
             VALUES ('{bid}', '{rid}', 'Vasagatan 1', 'Arlanda T5')"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query("SELECT * FROM bookings")
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get(7), Some("Vasagatan 1"));
    assert_eq!(rows[0].get(8), Some("Arlanda T5"));
}

#[tokio::test]
async fn reject_flow_retains_reason() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let rid = submit_rental(&client, vid, Ulid::new(), T0, T0 + D).await;

    client
        .batch_execute(&format!(
            "UPDATE rentals SET status = 'rejected', reason = 'no license on file' \
             WHERE id = '{rid}'"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query("SELECT * FROM rentals WHERE status = 'rejected'")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(5), Some("rejected"));
    assert_eq!(rows[0].get(7), Some("no license on file"));

    // Re-deciding a decided request is refused.
    let err = client
        .batch_execute(&format!("UPDATE rentals SET status = 'rejected' WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not pending"));

    // And a rejected request cannot be approved.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{rid}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not pending"));
}

#[tokio::test]
async fn delete_rental_is_soft() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let rid = submit_rental(&client, vid, Ulid::new(), T0, T0 + D).await;

    client
        .batch_execute(&format!("DELETE FROM rentals WHERE id = '{rid}'"))
        .await
        .unwrap();

    // The row is retained with a deleted status and excluded from the open view.
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM rentals WHERE id = '{rid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get(5), Some("deleted"));

    let open = data_rows(client.simple_query("SELECT * FROM rentals").await.unwrap());
    assert!(open.is_empty());
}

#[tokio::test]
async fn availability_reflects_bookings() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let rid = submit_rental(&client, vid, Ulid::new(), T0 + 2 * D, T0 + 4 * D).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{rid}')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE vehicle_id = '{vid}' \
                 AND start >= {T0} AND \"end\" <= {}",
                T0 + 7 * D
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(1), Some(T0.to_string().as_str()));
    assert_eq!(rows[0].get(2), Some((T0 + 2 * D).to_string().as_str()));
    assert_eq!(rows[1].get(1), Some((T0 + 4 * D).to_string().as_str()));
    assert_eq!(rows[1].get(2), Some((T0 + 7 * D).to_string().as_str()));
}

#[tokio::test]
async fn analytics_and_top_vehicles() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let busy = create_vehicle(&client, 10_000).await;
    let quiet = create_vehicle(&client, 5_000).await;

    for i in 0..2i64 {
        let rid = submit_rental(
            &client,
            busy,
            Ulid::new(),
            T0 + i * 2 * D,
            T0 + (i * 2 + 1) * D,
        )
        .await;
        client
            .batch_execute(&format!(
                "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{rid}')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    let rid = submit_rental(&client, quiet, Ulid::new(), T0, T0 + D).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{rid}')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM analytics").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some("0")); // no retained requests
    assert_eq!(rows[0].get(1), Some("3"));
    assert_eq!(rows[0].get(2), Some("25000")); // 2 × 10 000 + 1 × 5 000

    let top = data_rows(
        client
            .simple_query("SELECT * FROM top_vehicles")
            .await
            .unwrap(),
    );
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].get(0), Some(busy.to_string().as_str()));
    assert_eq!(top[0].get(1), Some("2"));
    assert_eq!(top[1].get(0), Some(quiet.to_string().as_str()));
}

#[tokio::test]
async fn vehicle_management_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    client
        .batch_execute(&format!(
            "UPDATE vehicles SET daily_rate = 12000, category = 'kombi' WHERE id = '{vid}'"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query("SELECT * FROM vehicles WHERE org_id = '556000-1234'")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(4), Some("kombi"));
    assert_eq!(rows[0].get(6), Some("12000"));

    // A booked vehicle cannot be removed.
    let rid = submit_rental(&client, vid, Ulid::new(), T0, T0 + D).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, rental_id) VALUES ('{}', '{rid}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("DELETE FROM vehicles WHERE id = '{vid}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bookings exist"));
}

#[tokio::test]
async fn rentals_pagination_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let renter = Ulid::new();
    for i in 0..15i64 {
        submit_rental(&client, vid, renter, T0 + i * D, T0 + (i + 1) * D).await;
    }

    let first = data_rows(
        client
            .simple_query("SELECT * FROM rentals WHERE page = 1 AND per_page = 10")
            .await
            .unwrap(),
    );
    assert_eq!(first.len(), 10);

    let second = data_rows(
        client
            .simple_query("SELECT * FROM rentals WHERE page = 2 AND per_page = 10")
            .await
            .unwrap(),
    );
    assert_eq!(second.len(), 5);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let rid = submit_rental(&client, vid, Ulid::new(), T0, T0 + D).await;

    let rows = client
        .query(
            "SELECT * FROM rentals WHERE id = $1",
            &[&rid.to_string().as_str()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let status: &str = rows[0].get(5);
    assert_eq!(status, "pending");
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect_db(addr, &format!("org_a_{}", Ulid::new())).await;
    let client_b = connect_db(addr, &format!("org_b_{}", Ulid::new())).await;

    let vid = create_vehicle(&client_a, 10_000).await;

    // Tenant B cannot see tenant A's fleet.
    let rows = data_rows(client_b.simple_query("SELECT * FROM vehicles").await.unwrap());
    assert!(rows.is_empty());

    // Submitting against A's vehicle from B's tenant fails.
    let err = client_b
        .batch_execute(&format!(
            "INSERT INTO rentals (id, vehicle_id, renter_id, start, \"end\") \
             VALUES ('{}', '{vid}', '{}', {T0}, {})",
            Ulid::new(),
            Ulid::new(),
            T0 + D
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn invalid_interval_rejected_at_the_edge() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, 10_000).await;
    let err = client
        .batch_execute(&format!(
            "INSERT INTO rentals (id, vehicle_id, renter_id, start, \"end\") \
             VALUES ('{}', '{vid}', '{}', {}, {T0})",
            Ulid::new(),
            Ulid::new(),
            T0 + D
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid interval"));
}
