pub mod chat {
    pub mod schema;
    pub mod model;
    pub mod policy;
    pub mod repository;
    pub mod repository_pg;
    pub mod repository_mem;
    pub mod service;
}
