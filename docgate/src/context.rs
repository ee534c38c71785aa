use docgate_core::{
    context::PeerAddr, log::RequestLogger, resource::ResourceSlot, trace::Trace,
};

// Fields are filled in stack order, the outer stages first.
certain_map::certain_map! {
    #[style = "unfilled"]
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[full(FullContext)]
    pub struct Context {
        // Set by ConnectionHandler
        peer_addr: PeerAddr,
        // Set by TraceHandler
        trace: Trace,
        logger: RequestLogger,
        // Set by CleanupHandler, filled by ResourceHandler
        resource: ResourceSlot,
    }
}
