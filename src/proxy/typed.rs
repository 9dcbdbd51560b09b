//! Typed wrappers for the common interfaces.

use super::Proxy;
use crate::interfaces::IMODULE;
use crate::module::ModuleState;
use crate::types::Result;
use serde_json::json;
use std::time::Duration;

/// A typed view over a [`Proxy`] bound to one interface.
pub trait TypedProxy: Sized {
    const INTERFACE: &'static str;

    fn from_proxy(proxy: Proxy) -> Self;

    fn proxy(&self) -> &Proxy;
}

macro_rules! typed_proxy {
    ($(#[$meta:meta])* $name:ident, $interface:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: Proxy,
        }

        impl TypedProxy for $name {
            const INTERFACE: &'static str = $interface;

            fn from_proxy(proxy: Proxy) -> Self {
                Self { inner: proxy }
            }

            fn proxy(&self) -> &Proxy {
                &self.inner
            }
        }
    };
}

typed_proxy!(
    /// Health and identity methods every module answers.
    ModuleProxy,
    IMODULE
);
typed_proxy!(AbortableProxy, "IAbortable");
typed_proxy!(CameraProxy, "ICamera");

impl ModuleProxy {
    pub async fn get_state(&self) -> Result<ModuleState> {
        self.inner.call_as("get_state", vec![], None).await
    }

    pub async fn get_error_string(&self) -> Result<String> {
        self.inner.call_as("get_error_string", vec![], None).await
    }

    pub async fn reset_error(&self) -> Result<bool> {
        self.inner.call_as("reset_error", vec![], None).await
    }

    pub async fn get_label(&self) -> Result<String> {
        self.inner.call_as("get_label", vec![], None).await
    }

    pub async fn get_version(&self) -> Result<String> {
        self.inner.call_as("get_version", vec![], None).await
    }
}

impl AbortableProxy {
    pub async fn abort(&self) -> Result<()> {
        self.inner.call("abort", vec![], None).await.map(drop)
    }
}

impl CameraProxy {
    /// Take an exposure and return the stored filename.
    pub async fn expose(&self, broadcast: Option<bool>) -> Result<String> {
        let args = broadcast.map(|b| vec![json!(b)]).unwrap_or_default();
        self.inner.call_as("expose", args, None).await
    }

    /// As [`expose`](Self::expose) with an explicit deadline.
    pub async fn expose_within(&self, broadcast: bool, deadline: Duration) -> Result<String> {
        self.inner
            .call_as("expose", vec![json!(broadcast)], Some(deadline))
            .await
    }

    pub async fn get_exposure_status(&self) -> Result<String> {
        self.inner.call_as("get_exposure_status", vec![], None).await
    }

    pub async fn get_exposure_progress(&self) -> Result<f64> {
        self.inner.call_as("get_exposure_progress", vec![], None).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.inner.call("abort", vec![], None).await.map(drop)
    }
}
