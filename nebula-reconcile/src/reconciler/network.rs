//! Virtual networks: a bridge plus one IPv4 address range, optionally with
//! part of the range held back for static use.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Calls, Desired, ResourceKind, quote};
use crate::clients::{Caller, Value};
use crate::document::ObservedObject;
use crate::error::{Error, Result};

/// Cluster argument for `one.vn.allocate`: the default cluster.
const DEFAULT_CLUSTER: i64 = -1;

const ADD_AR: &str = "one.vn.add_ar";
const UPDATE_AR: &str = "one.vn.update_ar";
const HOLD: &str = "one.vn.hold";
const RESERVE: &str = "one.vn.reserve";

/// How reserved addresses are carved out of the range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationMode {
    /// One hold call per address, starting at the range start.
    #[default]
    Hold,
    /// A single reservation call creating a reservation network of the given size.
    Reserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub size: u32,
    #[serde(default)]
    pub mode: ReservationMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttrs {
    /// Host bridge the network attaches to.
    pub bridge: String,
    pub ip_start: Ipv4Addr,
    pub ip_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
}

fn address_range(ar_id: Option<u32>, start: Ipv4Addr, size: u32) -> String {
    match ar_id {
        Some(ar_id) => {
            format!("AR = [\n  AR_ID = {ar_id},\n  TYPE = IP4,\n  IP = {start},\n  SIZE = {size} ]")
        }
        None => format!("AR = [\n  TYPE = IP4,\n  IP = {start},\n  SIZE = {size} ]"),
    }
}

/// The `offset`-th address after `start`, if it stays within IPv4.
fn nth_address(start: Ipv4Addr, offset: u32) -> Option<Ipv4Addr> {
    u32::from(start).checked_add(offset).map(Ipv4Addr::from)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkKind;

#[async_trait]
impl ResourceKind for NetworkKind {
    type Attrs = NetworkAttrs;

    const KIND: &'static str = "network";
    const ELEMENT: &'static str = "VNET";
    const CALLS: Calls = Calls {
        allocate: "one.vn.allocate",
        clone: None,
        info: "one.vn.info",
        pool_info: "one.vnpool.info",
        update: "one.vn.update",
        rename: "one.vn.rename",
        delete: "one.vn.delete",
        chmod: "one.vn.chmod",
    };

    fn validate(&self, spec: &Desired<NetworkAttrs>) -> Result<()> {
        let attrs = &spec.attrs;
        if attrs.bridge.trim().is_empty() {
            return Err(Error::Validation(format!(
                "network {} needs a bridge",
                spec.name
            )));
        }
        if attrs.ip_size == 0 {
            return Err(Error::Validation(format!(
                "network {} has an empty address range",
                spec.name
            )));
        }
        if nth_address(attrs.ip_start, attrs.ip_size - 1).is_none() {
            return Err(Error::Validation(format!(
                "address range {}+{} of network {} runs past 255.255.255.255",
                attrs.ip_start, attrs.ip_size, spec.name
            )));
        }
        match &attrs.reservation {
            Some(reservation) if reservation.size > attrs.ip_size => {
                Err(Error::Validation(format!(
                    "network {} reserves {} addresses out of a range of {}",
                    spec.name, reservation.size, attrs.ip_size
                )))
            }
            _ => Ok(()),
        }
    }

    fn body(&self, spec: &Desired<NetworkAttrs>) -> String {
        format!("{}\nBRIDGE = {}", spec.description, quote(&spec.attrs.bridge))
    }

    fn allocate_args(&self, _spec: &Desired<NetworkAttrs>, body: String) -> Vec<Value> {
        vec![Value::Str(body), Value::Int(DEFAULT_CLUSTER)]
    }

    async fn after_create(
        &self,
        client: &dyn Caller,
        id: i64,
        spec: &Desired<NetworkAttrs>,
    ) -> Result<()> {
        add_range_and_reserve(client, id, spec).await
    }

    async fn update_attrs(
        &self,
        client: &dyn Caller,
        id: i64,
        old: &NetworkAttrs,
        new: &Desired<NetworkAttrs>,
    ) -> Result<()> {
        let attrs = &new.attrs;

        // an interrupted create leaves the network without its range
        if old.ip_size == 0 {
            warn!(id, "Network has no address range, adding it");
            return add_range_and_reserve(client, id, new).await;
        }

        if old.ip_start != attrs.ip_start {
            warn!(
                id,
                from = %old.ip_start,
                to = %attrs.ip_start,
                "Changing the start address of an address range is not supported"
            );
        }

        if old.ip_size != attrs.ip_size {
            // the range keeps its applied start address
            client
                .call(
                    UPDATE_AR,
                    vec![
                        Value::Int(id),
                        Value::Str(address_range(Some(0), old.ip_start, attrs.ip_size)),
                    ],
                )
                .await?;
            info!(id, size = attrs.ip_size, "Resized address range");
        }

        if old.reservation != attrs.reservation {
            warn!(id, "Reservations are only applied at creation time");
        }
        Ok(())
    }

    /// A network without an `AR_ID = 0` range is observed with `ip_size = 0`.
    fn observe_attrs(&self, observed: &ObservedObject, baseline: &NetworkAttrs) -> NetworkAttrs {
        let first_range = observed
            .address_ranges
            .iter()
            .find(|ar| ar.get("AR_ID").map(String::as_str) == Some("0"));
        let ip_start = first_range
            .and_then(|ar| ar.get("IP"))
            .and_then(|ip| ip.parse().ok())
            .unwrap_or(baseline.ip_start);
        let ip_size = match first_range {
            Some(ar) => ar
                .get("SIZE")
                .and_then(|size| size.parse().ok())
                .unwrap_or(baseline.ip_size),
            None => 0,
        };

        NetworkAttrs {
            bridge: observed
                .field("BRIDGE")
                .map(str::to_string)
                .unwrap_or_else(|| baseline.bridge.clone()),
            ip_start,
            ip_size,
            reservation: baseline.reservation.clone(),
        }
    }
}

async fn add_range_and_reserve(
    client: &dyn Caller,
    id: i64,
    spec: &Desired<NetworkAttrs>,
) -> Result<()> {
    let attrs = &spec.attrs;
    client
        .call(
            ADD_AR,
            vec![
                Value::Int(id),
                Value::Str(address_range(None, attrs.ip_start, attrs.ip_size)),
            ],
        )
        .await?;
    info!(id, start = %attrs.ip_start, size = attrs.ip_size, "Added address range");

    let Some(reservation) = &attrs.reservation else {
        return Ok(());
    };
    if reservation.size == 0 {
        return Ok(());
    }

    match reservation.mode {
        ReservationMode::Hold => {
            for offset in 0..reservation.size {
                let ip = nth_address(attrs.ip_start, offset).ok_or_else(|| {
                    Error::Validation(format!("reservation of network {id} leaves IPv4"))
                })?;
                client
                    .call(
                        HOLD,
                        vec![Value::Int(id), Value::Str(format!("LEASES=[IP={ip}]"))],
                    )
                    .await?;
            }
            info!(id, count = reservation.size, "Held reserved addresses");
        }
        ReservationMode::Reserve => {
            let template = format!(
                "SIZE = {}\nNAME = {}",
                reservation.size,
                quote(&format!("{}-reservation", spec.name))
            );
            let reserved = client
                .call(RESERVE, vec![Value::Int(id), Value::Str(template)])
                .await?;
            info!(id, reservation = %reserved, size = reservation.size, "Reserved addresses");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clients::fake::FakeCaller;
    use crate::config::Config;
    use crate::document::fixtures::object;
    use crate::reconciler::Reconciler;

    fn reconciler(fake: Arc<FakeCaller>) -> Reconciler<NetworkKind> {
        let config = Config::new("http://one:2633/RPC2", "tester", "pw");
        Reconciler::new(NetworkKind, fake, &config)
    }

    fn spec(size: u32, reservation: Option<Reservation>) -> Desired<NetworkAttrs> {
        Desired {
            name: "test-vnet".to_string(),
            description: "FOO = \"bar\"".to_string(),
            permissions: "642".parse().unwrap(),
            attrs: NetworkAttrs {
                bridge: "br-test".to_string(),
                ip_start: Ipv4Addr::new(192, 168, 0, 254),
                ip_size: size,
                reservation,
            },
        }
    }

    fn vnet() -> String {
        object(
            "VNET",
            40,
            "test-vnet",
            "642",
            "<BRIDGE>br-test</BRIDGE><AR_POOL><AR><AR_ID>0</AR_ID><IP>192.168.0.254</IP>\
             <SIZE>10</SIZE></AR></AR_POOL>",
        )
    }

    #[tokio::test]
    async fn create_adds_range_and_holds_addresses() {
        let fake = Arc::new(FakeCaller::new());
        fake.respond("one.vn.allocate", Ok("40".into()));
        fake.respond("one.vn.chmod", Ok("40".into()));
        fake.respond(ADD_AR, Ok("40".into()));
        for _ in 0..3 {
            fake.respond(HOLD, Ok("40".into()));
        }
        fake.respond("one.vn.info", Ok(vnet()));

        let reservation = Reservation {
            size: 3,
            mode: ReservationMode::Hold,
        };
        reconciler(fake.clone())
            .create(&spec(10, Some(reservation)))
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(
            calls[0].args,
            vec![
                Value::from("NAME = \"test-vnet\"\nFOO = \"bar\"\nBRIDGE = \"br-test\""),
                Value::Int(-1)
            ]
        );
        assert_eq!(calls[1].method, "one.vn.chmod");
        assert_eq!(
            calls[2].args[1],
            Value::from("AR = [\n  TYPE = IP4,\n  IP = 192.168.0.254,\n  SIZE = 10 ]")
        );
        let held: Vec<Value> = calls
            .iter()
            .filter(|c| c.method == HOLD)
            .map(|c| c.args[1].clone())
            .collect();
        assert_eq!(
            held,
            vec![
                Value::from("LEASES=[IP=192.168.0.254]"),
                Value::from("LEASES=[IP=192.168.0.255]"),
                Value::from("LEASES=[IP=192.168.1.0]"),
            ]
        );
    }

    #[tokio::test]
    async fn create_with_reserve_mode_issues_one_call() {
        let fake = Arc::new(FakeCaller::new());
        fake.respond("one.vn.allocate", Ok("40".into()));
        fake.respond("one.vn.chmod", Ok("40".into()));
        fake.respond(ADD_AR, Ok("40".into()));
        fake.respond(RESERVE, Ok("41".into()));
        fake.respond("one.vn.info", Ok(vnet()));

        let reservation = Reservation {
            size: 4,
            mode: ReservationMode::Reserve,
        };
        reconciler(fake.clone())
            .create(&spec(10, Some(reservation)))
            .await
            .unwrap();

        assert_eq!(fake.count(HOLD), 0);
        let reserve = fake
            .calls()
            .into_iter()
            .find(|c| c.method == RESERVE)
            .unwrap();
        assert_eq!(
            reserve.args,
            vec![
                Value::Int(40),
                Value::from("SIZE = 4\nNAME = \"test-vnet-reservation\"")
            ]
        );
    }

    #[tokio::test]
    async fn oversized_reservation_is_rejected_before_allocate() {
        let fake = Arc::new(FakeCaller::new());
        let reservation = Reservation {
            size: 11,
            mode: ReservationMode::Hold,
        };
        let err = reconciler(fake.clone())
            .create(&spec(10, Some(reservation)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn size_change_updates_range_and_start_change_only_warns() {
        let fake = Arc::new(FakeCaller::new());
        fake.respond(UPDATE_AR, Ok("40".into()));

        let old = spec(10, None);
        let mut new = spec(20, None);
        new.attrs.ip_start = Ipv4Addr::new(10, 0, 0, 1);

        reconciler(fake.clone()).update(40, &old, &new).await.unwrap();

        let calls = fake.calls();
        assert_eq!(fake.methods(), vec![UPDATE_AR]);
        assert_eq!(
            calls[0].args[1],
            Value::from("AR = [\n  AR_ID = 0,\n  TYPE = IP4,\n  IP = 192.168.0.254,\n  SIZE = 20 ]")
        );
    }

    #[tokio::test]
    async fn bridge_change_rewrites_body() {
        let fake = Arc::new(FakeCaller::new());
        fake.respond("one.vn.update", Ok("40".into()));

        let old = spec(10, None);
        let mut new = spec(10, None);
        new.attrs.bridge = "br1".to_string();

        reconciler(fake.clone()).update(40, &old, &new).await.unwrap();

        assert_eq!(
            fake.calls()[0].args,
            vec![
                Value::Int(40),
                Value::from("FOO = \"bar\"\nBRIDGE = \"br1\""),
                Value::Int(0)
            ]
        );
        assert_eq!(fake.count(UPDATE_AR), 0);
    }

    #[test]
    fn observe_reads_first_range() {
        let observed = crate::document::decode_one(&vnet(), "VNET").unwrap();
        let attrs = NetworkKind.observe_attrs(&observed, &spec(3, None).attrs);
        assert_eq!(attrs.ip_size, 10);
        assert_eq!(attrs.ip_start, Ipv4Addr::new(192, 168, 0, 254));
        assert_eq!(attrs.bridge, "br-test");
    }

    #[test]
    fn observe_without_range_reports_empty_size() {
        let xml = object(
            "VNET",
            40,
            "test-vnet",
            "642",
            "<BRIDGE>br-test</BRIDGE><AR_POOL/>",
        );
        let observed = crate::document::decode_one(&xml, "VNET").unwrap();
        let attrs = NetworkKind.observe_attrs(&observed, &spec(10, None).attrs);
        assert_eq!(attrs.ip_size, 0);
        assert_eq!(attrs.ip_start, Ipv4Addr::new(192, 168, 0, 254));
    }

    #[tokio::test]
    async fn missing_range_is_added_with_its_reservation() {
        let fake = Arc::new(FakeCaller::new());
        fake.respond(ADD_AR, Ok("40".into()));
        fake.respond(HOLD, Ok("40".into()));

        let mut old = spec(10, None);
        old.attrs.ip_size = 0;
        let new = spec(
            10,
            Some(Reservation {
                size: 1,
                mode: ReservationMode::Hold,
            }),
        );

        reconciler(fake.clone()).update(40, &old, &new).await.unwrap();

        assert_eq!(fake.methods(), vec![ADD_AR, HOLD]);
        assert_eq!(
            fake.calls()[0].args[1],
            Value::from("AR = [\n  TYPE = IP4,\n  IP = 192.168.0.254,\n  SIZE = 10 ]")
        );
    }

    #[test]
    fn range_past_ipv4_end_is_invalid() {
        let mut bad = spec(10, None);
        bad.attrs.ip_start = Ipv4Addr::new(255, 255, 255, 250);
        assert!(matches!(
            NetworkKind.validate(&bad),
            Err(Error::Validation(_))
        ));
    }
}
