//! End-to-end tests: resolve a list of reservations, each with its vehicle,
//! each with its location, the way a query engine's resolvers would, and
//! check that every collection is queried once with only the fields the query
//! selected.

use futures::{executor, future};
use pretty_assertions::assert_eq;
use projection_loader::{
    Config, FieldSet, KeyBatch, Loader, LoaderConfig, LoaderRules, MemoryCollection, ObjectId,
    Record, Selection, ShapeRegistry,
};
use serde_json::{json, Value};
use std::{future::Future, pin::Pin, sync::Arc};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "shapes": [
        {
            "name": "Reservation",
            "fields": {
                "_id": "scalar",
                "state": "scalar",
                "pickupDate": "scalar",
                "vehicle": { "relation": "Vehicle" }
            }
        },
        {
            "name": "Vehicle",
            "fields": {
                "_id": "scalar",
                "vin": "scalar",
                "customerVehicleNumber": "scalar",
                "location": { "relation": "Location" }
            }
        },
        {
            "name": "Location",
            "fields": {
                "_id": "scalar",
                "name": "scalar",
                "address": "object"
            }
        }
    ]
}"#;

const RESERVATIONS: [&str; 5] = [
    "5f0000000000000000000001",
    "5f0000000000000000000002",
    "5f0000000000000000000003",
    "5f0000000000000000000004",
    "5f0000000000000000000005",
];

const VEHICLE_1: &str = "6a0000000000000000000001";
const VEHICLE_2: &str = "6a0000000000000000000002";
const LOCATION: &str = "7b0000000000000000000001";

type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<Record>, String>> + Send>>;
type Fetch = Box<dyn Fn(KeyBatch<ObjectId>) -> FetchFuture + Send + Sync>;
type RecordLoader<'a> = Loader<'a, ObjectId, Record, String, FetchFuture, Fetch>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn collection(name: &str, records: Vec<Value>) -> Arc<MemoryCollection> {
    Arc::new(MemoryCollection::with_records(
        name,
        records.into_iter().filter_map(Record::from_value),
    ))
}

struct Store {
    reservations: Arc<MemoryCollection>,
    vehicles: Arc<MemoryCollection>,
    locations: Arc<MemoryCollection>,
}

impl Store {
    fn new() -> Self {
        let reservations = RESERVATIONS
            .iter()
            .enumerate()
            .map(|(i, id)| {
                json!({
                    "_id": id,
                    "state": "confirmed",
                    "pickupDate": format!("2022-02-0{}", i + 1),
                    "vehicle": if i % 2 == 0 { VEHICLE_1 } else { VEHICLE_2 },
                })
            })
            .collect();

        Store {
            reservations: collection("reservations", reservations),
            vehicles: collection(
                "vehicles",
                vec![
                    json!({ "_id": VEHICLE_1, "vin": "VIN1", "customerVehicleNumber": "C-1", "location": LOCATION }),
                    json!({ "_id": VEHICLE_2, "vin": "VIN2", "customerVehicleNumber": "C-2", "location": LOCATION }),
                ],
            ),
            locations: collection(
                "locations",
                vec![json!({ "_id": LOCATION, "name": "Main St", "address": { "city": "Oslo" } })],
            ),
        }
    }
}

fn rules_for(collection: &Arc<MemoryCollection>, config: &LoaderConfig) -> LoaderRules<Fetch> {
    let collection = Arc::clone(collection);
    let fetch: Fetch = Box::new(move |batch: KeyBatch<ObjectId>| {
        let collection = Arc::clone(&collection);
        let fut: FetchFuture = Box::pin(async move {
            let ids: Vec<String> = batch.keys().iter().map(ObjectId::to_string).collect();
            Ok(collection.find(&ids[..], batch.fields()))
        });
        fut
    });

    LoaderRules::new(fetch).with_config(config)
}

struct Rules {
    reservations: LoaderRules<Fetch>,
    vehicles: LoaderRules<Fetch>,
    locations: LoaderRules<Fetch>,
}

impl Rules {
    fn new(store: &Store, config: &LoaderConfig) -> Self {
        Rules {
            reservations: rules_for(&store.reservations, config),
            vehicles: rules_for(&store.vehicles, config),
            locations: rules_for(&store.locations, config),
        }
    }
}

/// Everything one request needs: the shapes, and one loader per entity.
struct Request<'a> {
    shapes: &'a ShapeRegistry,
    reservations: RecordLoader<'a>,
    vehicles: RecordLoader<'a>,
    locations: RecordLoader<'a>,
}

impl<'a> Request<'a> {
    fn new(shapes: &'a ShapeRegistry, rules: &'a Rules) -> Self {
        Request {
            shapes,
            reservations: Loader::new(&rules.reservations),
            vehicles: Loader::new(&rules.vehicles),
            locations: Loader::new(&rules.locations),
        }
    }
}

async fn resolve_location(req: &Request<'_>, id: &str, selection: &Selection) -> Value {
    let fields = req.shapes.extract("Location", selection).unwrap();
    match req.locations.try_load(id, fields).await.unwrap() {
        None => Value::Null,
        Some(location) => Value::Object(location.into_inner()),
    }
}

async fn resolve_vehicle(req: &Request<'_>, id: &str, selection: &Selection) -> Value {
    let fields = req.shapes.extract("Vehicle", selection).unwrap();
    let vehicle = match req.vehicles.try_load(id, fields).await.unwrap() {
        None => return Value::Null,
        Some(vehicle) => vehicle,
    };

    let location = match (
        vehicle.get("location").and_then(Value::as_str),
        selection.child("location"),
    ) {
        (Some(location_id), Some(selection)) => resolve_location(req, location_id, selection).await,
        _ => Value::Null,
    };

    let mut vehicle = vehicle.into_inner();
    vehicle.insert("location".to_owned(), location);
    Value::Object(vehicle)
}

async fn resolve_reservation(req: &Request<'_>, id: &str, selection: &Selection) -> Value {
    let fields = req.shapes.extract("Reservation", selection).unwrap();
    let reservation = match req.reservations.try_load(id, fields).await.unwrap() {
        None => return Value::Null,
        Some(reservation) => reservation,
    };

    let vehicle = match (
        reservation.get("vehicle").and_then(Value::as_str),
        selection.child("vehicle"),
    ) {
        (Some(vehicle_id), Some(selection)) => resolve_vehicle(req, vehicle_id, selection).await,
        _ => Value::Null,
    };

    let mut reservation = reservation.into_inner();
    reservation.insert("vehicle".to_owned(), vehicle);
    Value::Object(reservation)
}

fn reservations_query() -> Selection {
    Selection::field("reservations").with_selections([
        Selection::field("totalCount"),
        Selection::field("nodes").with_selections([
            Selection::field("__typename"),
            Selection::field("state"),
            Selection::field("vehicle").with_selections([
                Selection::field("vin"),
                Selection::field("location").with_selections([Selection::field("name")]),
            ]),
        ]),
    ])
}

fn resolve_all(req: &Request<'_>, ids: &[&str], query: &Selection) -> Vec<Value> {
    let nodes = query.child("nodes").unwrap();
    executor::block_on(future::join_all(
        ids.iter().map(|id| resolve_reservation(req, id, nodes)),
    ))
}

#[test]
fn test_nested_query_fetches_each_collection_once() {
    init_tracing();

    let config = Config::from_json_str(CONFIG).unwrap();
    let store = Store::new();
    let rules = Rules::new(&store, &config.loader);
    let req = Request::new(&config.shapes, &rules);

    let query = reservations_query();
    let results = resolve_all(&req, &RESERVATIONS, &query);

    assert_eq!(store.reservations.queries(), 1);
    assert_eq!(store.vehicles.queries(), 1);
    assert_eq!(store.locations.queries(), 1);

    assert_eq!(
        results[1],
        json!({
            "_id": RESERVATIONS[1],
            "state": "confirmed",
            "vehicle": {
                "_id": VEHICLE_2,
                "vin": "VIN2",
                "location": { "_id": LOCATION, "name": "Main St" },
            },
        })
    );

    // Unselected fields were never fetched
    for result in &results {
        assert_eq!(result.get("pickupDate"), None);
        assert_eq!(result["vehicle"].get("customerVehicleNumber"), None);
        assert_eq!(result["vehicle"]["location"]["name"], json!("Main St"));
    }

    // Both vehicles were deduplicated across the five reservations
    assert_eq!(req.vehicles.cached_keys(), 2);
    assert_eq!(req.locations.cached_keys(), 1);
}

#[test]
fn test_nodes_projection() {
    let config = Config::from_json_str(CONFIG).unwrap();
    let query = reservations_query();

    // totalCount belongs to the connection, not the entity
    assert_eq!(
        config.shapes.extract_at("Reservation", &query, &["nodes"]),
        Ok(FieldSet::from(["state", "vehicle"]))
    );
}

#[test]
fn test_missing_reservation_resolves_null() {
    init_tracing();

    let config = Config::from_json_str(CONFIG).unwrap();
    let store = Store::new();
    let rules = Rules::new(&store, &config.loader);
    let req = Request::new(&config.shapes, &rules);

    let query = reservations_query();
    let results = resolve_all(
        &req,
        &[RESERVATIONS[0], "5f00000000000000000000ff"],
        &query,
    );

    assert_eq!(results[0]["vehicle"]["vin"], json!("VIN1"));
    assert_eq!(results[1], Value::Null);
    assert_eq!(store.reservations.queries(), 1);
}

#[test]
fn test_batch_size_limit_from_config() {
    init_tracing();

    let mut config = Config::from_json_str(CONFIG).unwrap();
    config.loader = serde_json::from_value(json!({ "max_batch_size": 2 })).unwrap();

    let store = Store::new();
    let rules = Rules::new(&store, &config.loader);
    let req = Request::new(&config.shapes, &rules);

    let query = reservations_query();
    let results = resolve_all(&req, &RESERVATIONS, &query);

    assert_eq!(store.reservations.queries(), 3);
    assert!(results
        .iter()
        .all(|result| result["vehicle"]["location"]["name"] == json!("Main St")));
}
