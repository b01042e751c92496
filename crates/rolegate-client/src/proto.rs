pub mod rolegate {
    pub mod v1 {
        tonic::include_proto!("rolegate.v1");
    }
}
