use crate::{types, RpcFunction};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    any::type_name,
    collections::BTreeMap,
    fmt,
    future::Future,
    marker::PhantomData,
    sync::Arc,
};
use thiserror::Error;

/// Maps qualified `Service.Method` names to type-erased [`RpcFunction`]s.
///
/// Populated only through [`Dispatcher::register`]; lookups clone the handler
/// out from under the lock so calls never hold it.
#[derive(Default)]
pub(crate) struct Dispatcher {
    rpc_functions: RwLock<BTreeMap<String, Arc<dyn DynamicRpcFunction>>>,
}

impl Dispatcher {
    /// Inserts every method of `service`, or nothing at all.
    pub(crate) fn register(&self, service: Service) -> Result<(), RegisterError> {
        let Service { name, functions } = service;
        check_identifier(&name)?;
        if functions.is_empty() {
            return Err(RegisterError::NoMethods(name));
        }

        let mut entries = BTreeMap::new();
        for rfn in functions {
            check_identifier(rfn.name())?;
            let full = format!("{name}.{}", rfn.name());
            if entries.insert(full.clone(), rfn).is_some() {
                return Err(RegisterError::Duplicate(full));
            }
        }

        let mut rpc_functions = self.rpc_functions.write();
        if let Some(taken) = entries.keys().find(|q| rpc_functions.contains_key(*q)) {
            return Err(RegisterError::Duplicate(taken.clone()));
        }
        rpc_functions.extend(entries);
        Ok(())
    }

    pub(crate) async fn call(&self, name: &str, args: Vec<u8>) -> CallResult {
        let rfn = self
            .rpc_functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::NoSuchFunction(name.to_owned()))?;
        rfn.call(args).await
    }

    pub(crate) fn rpc_functions(&self) -> Vec<RpcFunctionInfo> {
        self.rpc_functions
            .read()
            .iter()
            .map(|(name, rfn)| RpcFunctionInfo {
                name: name.clone(),
                signature: rfn.signature(),
            })
            .collect()
    }
}

fn check_identifier(name: &str) -> Result<(), RegisterError> {
    if name.is_empty() || name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(RegisterError::InvalidName(name.to_owned()));
    }
    Ok(())
}

pub(crate) type CallResult = Result<Vec<u8>, DispatchError>;

/// A named group of [`RpcFunction`]s, registered together.
///
/// Each function is reachable by the peer as `Service.Method`.
pub struct Service {
    name: String,
    functions: Vec<Arc<dyn DynamicRpcFunction>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Adds a function implementing [`RpcFunction`] under its own [`name`](RpcFunction::name).
    pub fn add<RFn>(mut self, rpc_function: RFn) -> Self
    where
        RFn: RpcFunction,
    {
        let signature = Signature::of::<RFn>();
        self.functions.push(Arc::new(TypedRpcFunction {
            rpc_function,
            signature,
        }));
        self
    }

    /// Adds an async closure taking one argument value and returning one reply value.
    pub fn method<F, A, Fut, R, E>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.add(FnRpcFunction {
            name: name.into(),
            f,
            _args: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field(
                "functions",
                &self.functions.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Argument and reply types a function was registered with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub args: String,
    pub reply: String,
}

impl Signature {
    fn of<RFn: RpcFunction>() -> Self {
        Self {
            args: type_name::<RFn::Args>().to_owned(),
            reply: type_name::<RFn::Reply>().to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcFunctionInfo {
    pub name: String,
    pub signature: Signature,
}

struct FnRpcFunction<F, A> {
    name: String,
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<F, A, Fut, R, E> RpcFunction for FnRpcFunction<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Args = A;
    type Reply = R;
    type Error = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: A) -> BoxFuture<'_, Result<R, E>> {
        Box::pin((self.f)(args))
    }
}

struct TypedRpcFunction<RFn> {
    rpc_function: RFn,
    signature: Signature,
}

impl<RFn> TypedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    async fn call(&self, args: Vec<u8>) -> CallResult {
        let decoded_args: RFn::Args =
            types::decode(&args).map_err(|e| DispatchError::BadArgs(e.to_string()))?;
        let retval = self
            .rpc_function
            .call(decoded_args)
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?;
        types::encode(&retval).map_err(|e| DispatchError::BadReply(e.to_string()))
    }
}

/// A type-erased version of the main trait, RpcFunction
trait DynamicRpcFunction: Send + Sync {
    fn name(&self) -> &str;
    fn signature(&self) -> Signature;
    fn call(&self, args: Vec<u8>) -> BoxFuture<'_, CallResult>;
}

impl<RFn> DynamicRpcFunction for TypedRpcFunction<RFn>
where
    RFn: RpcFunction,
{
    fn name(&self) -> &str {
        self.rpc_function.name()
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn call(&self, args: Vec<u8>) -> BoxFuture<'_, CallResult> {
        Box::pin(self.call(args))
    }
}

/// Why the remote side could not produce a reply. Travels in the response envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("rpc: can't find method {0}")]
    NoSuchFunction(String),

    #[error("argument type mismatch: {0}")]
    BadArgs(String),

    #[error("(BUG in RPC function) reply could not be encoded: {0}")]
    BadReply(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("invalid service or method name {0:?}")]
    InvalidName(String),

    #[error("service {0} has no methods")]
    NoMethods(String),

    #[error("method already registered: {0}")]
    Duplicate(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    async fn add(args: Args) -> Result<i64, String> {
        Ok(args.a + args.b)
    }

    async fn fail(_: ()) -> Result<(), String> {
        Err("nope".to_owned())
    }

    fn arith() -> Service {
        Service::new("Arith").method("Add", add)
    }

    #[tokio::test]
    async fn calls_registered_function() {
        let dispatcher = Dispatcher::default();
        dispatcher.register(arith()).unwrap();

        let args = types::encode(&Args { a: 2, b: 3 }).unwrap();
        let reply = dispatcher.call("Arith.Add", args).await.unwrap();
        assert_eq!(types::decode::<i64>(&reply).unwrap(), 5);
    }

    #[tokio::test]
    async fn names_are_case_sensitive() {
        let dispatcher = Dispatcher::default();
        dispatcher.register(arith()).unwrap();

        let err = dispatcher.call("arith.add", Vec::new()).await.unwrap_err();
        assert_eq!(err, DispatchError::NoSuchFunction("arith.add".to_owned()));
    }

    #[tokio::test]
    async fn handler_errors_and_bad_args_are_reported() {
        let dispatcher = Dispatcher::default();
        dispatcher
            .register(arith().method("Fail", fail))
            .unwrap();

        let err = dispatcher
            .call("Arith.Fail", types::encode(&()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Failed("nope".to_owned()));

        let err = dispatcher.call("Arith.Add", vec![1]).await.unwrap_err();
        assert!(matches!(err, DispatchError::BadArgs(_)));
    }

    #[test]
    fn duplicate_registration_inserts_nothing() {
        let dispatcher = Dispatcher::default();
        dispatcher.register(arith()).unwrap();

        let again = Service::new("Arith")
            .method("Fail", fail)
            .method("Add", add);
        assert_eq!(
            dispatcher.register(again),
            Err(RegisterError::Duplicate("Arith.Add".to_owned()))
        );

        let names: Vec<_> = dispatcher.rpc_functions().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["Arith.Add"]);
    }

    #[test]
    fn rejects_malformed_services() {
        let dispatcher = Dispatcher::default();
        assert_eq!(
            dispatcher.register(Service::new("Empty")),
            Err(RegisterError::NoMethods("Empty".to_owned()))
        );
        assert_eq!(
            dispatcher.register(Service::new("A.B").method("Add", add)),
            Err(RegisterError::InvalidName("A.B".to_owned()))
        );
        assert_eq!(
            dispatcher.register(Service::new("Arith").method("", add)),
            Err(RegisterError::InvalidName(String::new()))
        );
        assert_eq!(
            dispatcher.register(Service::new("Arith").method("Add", add).method("Add", add)),
            Err(RegisterError::Duplicate("Arith.Add".to_owned()))
        );
        assert!(dispatcher.rpc_functions().is_empty());
    }

    #[test]
    fn services_describe_themselves() {
        let service = arith().method("Fail", fail);
        assert_eq!(service.name(), "Arith");
        assert_eq!(
            format!("{service:?}"),
            r#"Service { name: "Arith", functions: ["Add", "Fail"] }"#
        );
    }

    #[test]
    fn lists_signatures() {
        let dispatcher = Dispatcher::default();
        dispatcher.register(arith()).unwrap();

        let info = dispatcher.rpc_functions().remove(0);
        assert_eq!(info.name, "Arith.Add");
        assert!(info.signature.args.ends_with("Args"));
        assert_eq!(info.signature.reply, "i64");
    }
}
