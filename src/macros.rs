/// Implements [`RpcFunction::call`](crate::RpcFunction::call) and its associated types
/// from an `async fn`-shaped body.
#[macro_export]
macro_rules! call {
    (async fn call(& $self:ident, $args_ident:ident : $args_ty:ty) -> Result<$reply_ty:ty, $error_ty:ty> { $($body:tt)* }) => {
        type Args = $args_ty;
        type Reply = $reply_ty;
        type Error = $error_ty;

        fn call<'call>(
            &'call $self,
            $args_ident: $args_ty,
        ) -> $crate::BoxFuture<'call, ::std::result::Result<$reply_ty, $error_ty>> {
            let body = async move {
                $($body)*
            };
            Box::pin(body)
        }
    };
}

#[macro_export]
macro_rules! name {
    ($name:expr) => {
        fn name(&self) -> &str {
            $name
        }
    };
}
