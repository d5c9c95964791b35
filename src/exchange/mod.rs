//! Exchange connectivity: REST client, websockets, simulator, adapter.
//!
//! The adapter is the only surface strategies touch. It multiplexes market
//! data out to every trader, routes orders to the right endpoint (or the
//! simulator in test mode), and normalises the exchange's three order-id
//! spaces into one.

mod adapter;
mod client;
mod simulator;
mod types;
mod websocket;

pub use adapter::ExchangeAdapter;
pub use client::{OrderRequest, RestClient};
pub use simulator::{SimFill, SimOrder, SimPosition, Simulator};
pub use types::*;
pub use websocket::{MarketSocket, MarketWsEvent, UserSocket, UserWsEvent};
