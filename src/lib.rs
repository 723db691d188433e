//! projection-loader is a request-scoped implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) for stores
//! that can project fields. It batches the individual record lookups made
//! while answering one query into a single backend fetch, asks the backend
//! for only the fields somebody actually selected, and remembers what it
//! loaded so that no record is fetched twice in the same request.
//!
//! ## Overview
//!
//! A query for a list of reservations, each with its vehicle, each with its
//! location, naively costs one lookup per vehicle and one per location (the
//! N+1 problem). Each of those lookups is made by code that only knows about
//! its own record. This crate lets that code keep asking for one record at a
//! time:
//!
//! 1. [`extract`] (or [`ShapeRegistry::extract`]) turns the query's
//!    [`Selection`] for an entity into the flat [`FieldSet`] the backend
//!    needs for it.
//! 2. [`Loader::load`] queues the key and those fields. Every load made
//!    during the same scheduling turn goes into the same batch.
//! 3. When the batch's futures are awaited, the fetch function is called once,
//!    with every distinct key and the union of every caller's fields, and each
//!    caller gets its own record back.
//!
//! First, adapt your backend query to a fetch function. It takes a
//! [`KeyBatch`] and returns the records it found, in any order; records say
//! which key they belong to through the [`KeyedEntry`] trait. Keys with no
//! record resolve as `Ok(None)`.
//!
//! Fetch functions are stored in [`LoaderRules`], which are built once when the
//! process starts. A backend handle is injected by capturing it in the
//! closure:
//!
//! ```
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use projection_loader::{KeyBatch, LoaderRules, MemoryCollection, Record};
//! use serde_json::json;
//!
//! let companies = Arc::new(MemoryCollection::with_records(
//!     "companies",
//!     vec![
//!         json!({ "_id": "acme", "name": "Acme", "city": "Oslo" }),
//!         json!({ "_id": "binford", "name": "Binford", "city": "Detroit" }),
//!     ]
//!     .into_iter()
//!     .filter_map(Record::from_value),
//! ));
//!
//! let rules = LoaderRules::new({
//!     let companies = Arc::clone(&companies);
//!     move |batch: KeyBatch<String>| {
//!         let companies = Arc::clone(&companies);
//!         async move { Ok::<_, Infallible>(companies.find(batch.keys(), batch.fields())) }
//!     }
//! });
//! ```
//!
//! Then, for each incoming request, create a [`Loader`] borrowing those rules,
//! and load through it. Here two independent lookups, asking for different
//! fields, share one fetch:
//!
//! ```
//! # use std::convert::Infallible;
//! # use std::sync::Arc;
//! # use projection_loader::{KeyBatch, LoaderRules, MemoryCollection, Record};
//! # use serde_json::json;
//! # let companies = Arc::new(MemoryCollection::with_records(
//! #     "companies",
//! #     vec![
//! #         json!({ "_id": "acme", "name": "Acme", "city": "Oslo" }),
//! #         json!({ "_id": "binford", "name": "Binford", "city": "Detroit" }),
//! #     ]
//! #     .into_iter()
//! #     .filter_map(Record::from_value),
//! # ));
//! # let rules = LoaderRules::new({
//! #     let companies = Arc::clone(&companies);
//! #     move |batch: KeyBatch<String>| {
//! #         let companies = Arc::clone(&companies);
//! #         async move { Ok::<_, Infallible>(companies.find(batch.keys(), batch.fields())) }
//! #     }
//! # });
//! use futures::{executor, future};
//! use projection_loader::{FieldSet, Loader};
//!
//! let loader = Loader::new(&rules);
//!
//! let acme = loader.load("acme".to_owned(), FieldSet::from(["name"]));
//! let binford = loader.load("binford".to_owned(), FieldSet::from(["city"]));
//!
//! let (acme, binford) = executor::block_on(future::join(acme, binford));
//!
//! // Both callers got every field either of them asked for
//! let acme = acme.unwrap().unwrap();
//! assert_eq!(acme.get("name"), Some(&json!("Acme")));
//! let binford = binford.unwrap().unwrap();
//! assert_eq!(binford.get("city"), Some(&json!("Detroit")));
//!
//! assert_eq!(companies.queries(), 1);
//! ```
//!
//! ## Design notes
//!
//! ### The batching window
//!
//! A batch stays open for exactly one scheduling turn. When one of its
//! futures is first polled, it notes how many keys the batch holds and
//! yields. The batch is dispatched at the first later poll that finds no new
//! keys, which is to say once every task that was ready to run has had the
//! chance to add its keys. There is no fixed timer unless you ask for one
//! with [`LoaderRules::with_delay`]; [`LoaderRules::with_max_batch_size`]
//! closes a batch early.
//!
//! ### Field merging
//!
//! Projections are per batch, not per key, so the batch fetches the union of
//! the fields every member asked for. A caller may get back more fields than
//! it asked for, never fewer.
//!
//! ### Matching results to keys
//!
//! Records are matched to callers by the key they declare ([`KeyedEntry`]),
//! never by position, so a fetch function can return records in whatever
//! order its backend produces and simply leave out the ones that don't exist.
//! A record for a key that wasn't asked for, a record with no key, or (by
//! default) two records for one key fails the whole batch with
//! [`LoadError::AdapterContractViolation`], rather than risk handing one
//! caller another caller's record.
//!
//! ### The request cache
//!
//! A loader remembers every key it has seen. Loading a key again returns the
//! pending or settled outcome of the first load. If the later call asks for
//! fields the original batch didn't fetch, and that batch has already been
//! dispatched, the key is loaded again with the wider projection and the
//! cache is updated. There is no eviction; drop the loader when the request
//! ends.
//!
//! ### Poll-driven design.
//!
//! All of the asynchronous work is driven through polling [`BatchFuture`].
//! The fetch function is not scheduled in any runtime or run in the
//! background; it is driven directly in the foreground by one of the batch's
//! futures. If that future is dropped, another waiting future is woken to
//! take over. A batch whose futures are never polled is never fetched.
//!
//! ### Failures
//!
//! A fetch failure is reported to every member of the batch as
//! [`LoadError::FetchFailed`]. Nothing is retried. A key that can't be
//! converted to the backend's id type ([`Loader::try_load`]) fails only its
//! own caller, with [`LoadError::MalformedKey`].
//!
//! ### Diagnostics
//!
//! Batches are traced with [`tracing`]: `debug` when a batch is dispatched
//! and settled, `trace` for cache hits, `warn` for fetch failures and contract
//! violations. Installing a subscriber is left to the application.

mod batch;
mod config;
mod data;
mod error;
mod fields;
mod key;
mod projection;
mod record;
mod store;
mod wakerset;

pub use batch::{BatchFuture, LoadResult, Loader, LoaderRules};
pub use config::{Config, LoaderConfig};
pub use data::{KeyBatch, KeyedEntry, OnDuplicate};
pub use error::{ConfigError, ContractViolation, LoadError, MalformedKey, SelectionError};
pub use fields::FieldSet;
pub use key::ObjectId;
pub use projection::{extract, extract_at, EntityShape, FieldKind, Selection, ShapeRegistry};
pub use record::Record;
pub use store::MemoryCollection;
