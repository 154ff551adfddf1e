pub mod error;
pub mod result;

pub trait AddMsg {
    fn add_msg<S: Into<String>>(self, msg: S) -> Self;
}

pub trait AddFunctionName {
    fn add_fn_name<S: Into<String>>(self, fn_name: S) -> Self;
}

/// Text of a panic payload caught with `catch_unwind`.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
