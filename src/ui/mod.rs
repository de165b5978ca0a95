// Console rendering of monitor events

pub mod formatters;

pub use formatters::{format_alarm_change, format_event, format_time, format_vitals, print_snapshot, print_stats};
