pub mod warehouse_counts;
