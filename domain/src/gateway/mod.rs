pub mod ai_analysis;
pub mod broker;
pub mod brokerage;
pub mod exchange;
pub mod market_data;
