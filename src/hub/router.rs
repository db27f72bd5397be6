//! Method dispatch table
//!
//! A [`HubDefinition`] maps method names to type-erased handlers. It is built
//! once per hub type through [`HubDefinitionBuilder`] and never changes
//! afterwards. Lookups are case-insensitive, so two methods whose names differ
//! only in case are rejected at build time.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn echo(_hub: Arc<ChatHub>, _ctx: HubContext, Arg(text): Arg<String>) -> HubResult<String> {
//!     Ok(text)
//! }
//!
//! let definition = HubDefinition::<ChatHub>::builder()
//!     .method("Echo", echo)
//!     .build()?;
//! ```

use crate::config::HubOptionsOverride;
use crate::hub::context::HubContext;
use crate::hub::method::{
    Hub, HubResult, IntoMethodResult, IntoStreamResult, MethodOutput, ReturnShape,
};
use crate::hub::params::{ArgumentBinder, FromInvocation, ParameterDescriptor};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

// =============================================================================
// Handler registration
// =============================================================================

/// A call with all parameters bound, waiting for a hub instance.
pub type BoundCall<H, O> = Box<dyn FnOnce(Arc<H>, HubContext) -> BoxFuture<'static, O> + Send>;

/// Type-erased method handler stored in the table
pub type DynMethod<H> = Arc<
    dyn Fn(&mut ArgumentBinder) -> HubResult<BoundCall<H, HubResult<MethodOutput>>> + Send + Sync,
>;

/// Async functions usable as hub methods.
///
/// Implemented for closures `Fn(Arc<H>, HubContext, P1, .., Pn) -> Future`
/// where every `Pi` is a [`FromInvocation`] parameter.
pub trait MethodHandler<H, Args>: Clone + Send + Sync + 'static {
    type Output: Send + 'static;

    fn parameters() -> Vec<ParameterDescriptor>;

    fn bind(&self, binder: &mut ArgumentBinder) -> HubResult<BoundCall<H, Self::Output>>;
}

macro_rules! impl_method_handler {
    ($($param:ident),*) => {
        impl<H, F, Fut, $($param,)*> MethodHandler<H, ($($param,)*)> for F
        where
            H: Send + Sync + 'static,
            F: Fn(Arc<H>, HubContext, $($param),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future + Send + 'static,
            Fut::Output: Send + 'static,
            $($param: FromInvocation,)*
        {
            type Output = Fut::Output;

            fn parameters() -> Vec<ParameterDescriptor> {
                vec![$($param::descriptor()),*]
            }

            #[allow(non_snake_case, unused_variables)]
            fn bind(&self, binder: &mut ArgumentBinder) -> HubResult<BoundCall<H, Self::Output>> {
                $(let $param = $param::from_invocation(binder)?;)*
                let handler = self.clone();
                let call: BoundCall<H, Self::Output> =
                    Box::new(move |hub: Arc<H>, ctx: HubContext| -> BoxFuture<'static, Fut::Output> {
                        Box::pin(handler(hub, ctx, $($param),*))
                    });
                Ok(call)
            }
        }
    };
}

impl_method_handler!();
impl_method_handler!(P1);
impl_method_handler!(P1, P2);
impl_method_handler!(P1, P2, P3);
impl_method_handler!(P1, P2, P3, P4);
impl_method_handler!(P1, P2, P3, P4, P5);
impl_method_handler!(P1, P2, P3, P4, P5, P6);
impl_method_handler!(P1, P2, P3, P4, P5, P6, P7);
impl_method_handler!(P1, P2, P3, P4, P5, P6, P7, P8);

// =============================================================================
// Method descriptor
// =============================================================================

/// Everything the dispatcher needs to know about one hub method.
pub struct MethodDescriptor<H> {
    pub name: String,
    pub parameters: Vec<ParameterDescriptor>,
    pub shape: ReturnShape,
    /// Policies the caller must satisfy, in addition to hub-level ones
    pub policies: Vec<String>,
    handler: DynMethod<H>,
}

impl<H> MethodDescriptor<H> {
    /// Parameters filled from positional wire arguments
    pub fn wire_argument_count(&self) -> usize {
        self.parameters.iter().filter(|p| p.is_wire_argument()).count()
    }

    /// Upload stream parameters
    pub fn stream_parameter_count(&self) -> usize {
        self.parameters.iter().filter(|p| p.is_stream()).count()
    }

    pub fn is_streaming(&self) -> bool {
        self.shape == ReturnShape::Stream
    }

    /// Bind parameters; the returned call runs against a hub instance.
    pub fn bind(
        &self,
        binder: &mut ArgumentBinder,
    ) -> HubResult<BoundCall<H, HubResult<MethodOutput>>> {
        (self.handler)(binder)
    }
}

impl<H> std::fmt::Debug for MethodDescriptor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("shape", &self.shape)
            .field("policies", &self.policies)
            .finish()
    }
}

// =============================================================================
// Hub definition
// =============================================================================

/// Immutable dispatch table for hub type `H`.
pub struct HubDefinition<H> {
    methods: HashMap<String, MethodDescriptor<H>>,
    policies: Vec<String>,
    options: HubOptionsOverride,
}

impl<H: Hub> HubDefinition<H> {
    pub fn builder() -> HubDefinitionBuilder<H> {
        HubDefinitionBuilder {
            methods: Vec::new(),
            policies: Vec::new(),
            options: HubOptionsOverride::default(),
        }
    }
}

impl<H> HubDefinition<H> {
    /// Case-insensitive method lookup
    pub fn find(&self, name: &str) -> Option<&MethodDescriptor<H>> {
        self.methods.get(&name.to_lowercase())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.values().map(|m| m.name.as_str()).collect()
    }

    /// Policies applying to every method of the hub
    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    /// Per-hub option overrides
    pub fn options(&self) -> &HubOptionsOverride {
        &self.options
    }
}

/// Names reserved for hub lifecycle hooks.
const RESERVED_NAMES: &[&str] = &["onconnected", "ondisconnected", "dispose"];

pub struct HubDefinitionBuilder<H> {
    methods: Vec<MethodDescriptor<H>>,
    policies: Vec<String>,
    options: HubOptionsOverride,
}

impl<H: Hub> HubDefinitionBuilder<H> {
    /// Register a method returning `HubResult<T>` (`T = ()` for void methods).
    pub fn method<F, Args>(self, name: &str, handler: F) -> Self
    where
        F: MethodHandler<H, Args>,
        F::Output: IntoMethodResult,
        Args: 'static,
    {
        let shape = <F::Output as IntoMethodResult>::shape();
        let erased: DynMethod<H> = Arc::new(move |binder: &mut ArgumentBinder| {
            let call = handler.bind(binder)?;
            let bound: BoundCall<H, HubResult<MethodOutput>> = Box::new(
                move |hub: Arc<H>, ctx: HubContext| -> BoxFuture<'static, HubResult<MethodOutput>> {
                    Box::pin(async move { call(hub, ctx).await.into_method_result() })
                },
            );
            Ok(bound)
        });
        self.push(name, F::parameters(), shape, erased)
    }

    /// Register a method returning `HubResult<impl Stream<Item = HubResult<T>>>`.
    pub fn stream_method<F, Args>(self, name: &str, handler: F) -> Self
    where
        F: MethodHandler<H, Args>,
        F::Output: IntoStreamResult,
        Args: 'static,
    {
        let erased: DynMethod<H> = Arc::new(move |binder: &mut ArgumentBinder| {
            let call = handler.bind(binder)?;
            let bound: BoundCall<H, HubResult<MethodOutput>> = Box::new(
                move |hub: Arc<H>, ctx: HubContext| -> BoxFuture<'static, HubResult<MethodOutput>> {
                    Box::pin(async move {
                        call(hub, ctx).await.into_stream().map(MethodOutput::Stream)
                    })
                },
            );
            Ok(bound)
        });
        self.push(name, F::parameters(), ReturnShape::Stream, erased)
    }

    /// Require `policy` for every method of the hub
    pub fn authorize(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Require `policy` for one method, registered earlier under `name`
    pub fn authorize_method(mut self, name: &str, policy: impl Into<String>) -> Self {
        let policy = policy.into();
        for method in self
            .methods
            .iter_mut()
            .filter(|m| m.name.eq_ignore_ascii_case(name))
        {
            method.policies.push(policy.clone());
        }
        self
    }

    /// Per-hub option overrides
    pub fn options(mut self, options: HubOptionsOverride) -> Self {
        self.options = options;
        self
    }

    fn push(
        mut self,
        name: &str,
        parameters: Vec<ParameterDescriptor>,
        shape: ReturnShape,
        handler: DynMethod<H>,
    ) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.to_string(),
            parameters,
            shape,
            policies: Vec::new(),
            handler,
        });
        self
    }

    pub fn build(self) -> Result<HubDefinition<H>, HubBuildError> {
        let mut methods = HashMap::new();
        for method in self.methods {
            let key = method.name.to_lowercase();
            if RESERVED_NAMES.contains(&key.as_str()) {
                return Err(HubBuildError::ReservedName(method.name));
            }
            if method.name.is_empty() {
                return Err(HubBuildError::EmptyName);
            }
            if methods.contains_key(&key) {
                return Err(HubBuildError::DuplicateMethod(method.name));
            }
            methods.insert(key, method);
        }
        Ok(HubDefinition {
            methods,
            policies: self.policies,
            options: self.options,
        })
    }
}

/// Errors raised while building a dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubBuildError {
    /// Two methods share a case-insensitive name
    DuplicateMethod(String),
    /// A method uses a lifecycle hook name
    ReservedName(String),
    EmptyName,
}

impl std::fmt::Display for HubBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubBuildError::DuplicateMethod(name) => write!(
                f,
                "Duplicate definitions of '{}'. Overloading is not supported.",
                name
            ),
            HubBuildError::ReservedName(name) => write!(
                f,
                "'{}' is reserved for hub lifecycle hooks and cannot be a hub method.",
                name
            ),
            HubBuildError::EmptyName => write!(f, "Hub method names cannot be empty."),
        }
    }
}

impl std::error::Error for HubBuildError {}

// =============================================================================
// Tests
// =============================================================================
