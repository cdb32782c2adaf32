pub mod interval_queries;
