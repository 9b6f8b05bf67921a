mod price_monitor;

pub use price_monitor::{MonitorStatus, PriceCallback, PriceMonitor, TriggerSink};
