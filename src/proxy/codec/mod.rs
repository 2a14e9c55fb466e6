mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::{HeaderAccumulator, first_value_map, is_hop_by_hop};
pub(crate) use line::read_line_with_timeout;
pub(crate) use request::{RequestHead, read_request_head};
pub(crate) use response::{
    ResponseBodyPlan, ResponseHead, read_response_head, response_body_plan,
};
