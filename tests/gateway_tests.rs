mod common;

mod pipeline {
    pub mod universal_rpc_test;
}

mod rpc {
    pub mod racer_failover_test;
}

mod bus {
    pub mod fanout_test;
}
