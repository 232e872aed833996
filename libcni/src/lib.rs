//! Netlink and network-namespace primitives shared by the CNI plugins.
//!
//! Every helper opens its own rtnetlink socket. A netlink socket is bound to
//! the namespace of the thread that created it, so a fresh handle per call is
//! what lets callers wrap these helpers in [`ns::netns::exec_netns`].

pub mod ip {
    pub mod addr;
    pub mod link;
    pub mod veth;
}

pub mod ns {
    pub mod netns;
}
