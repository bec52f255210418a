//! Dashboard data: build KPIs.

pub mod kpi;
