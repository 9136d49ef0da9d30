//! Generated protobuf modules
//!
//! build.rs compiles the vendored `.proto` files under `protos/meshtastic`; prost emits
//! one file per package (`meshtastic.rs`) which is included here.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes because large portions of the
    //! generated API are unused by the bridge itself.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
