//! Channel endpoint addressing.
//!
//! Every started kernel exposes one endpoint of the form
//! `<base>/api/kernels/<kernelId>/channels`; a connecting party supplies its
//! client id via the `session_id` query parameter.

/// Collection path for kernels under the endpoint base.
pub const KERNEL_SERVICE_PATH: &str = "api/kernels";

/// Query parameter carrying the connecting client id.
pub const CLIENT_ID_PARAM: &str = "session_id";

/// Build the channel endpoint address for a kernel.
pub fn channels_url(base: &str, kernel_id: &str) -> String {
    format!(
        "{}/{KERNEL_SERVICE_PATH}/{kernel_id}/channels",
        base.trim_end_matches('/')
    )
}

/// Split an endpoint address into its path and the client id carried in the
/// query string, if any.
pub fn split_client_id(url: &str) -> (&str, Option<&str>) {
    let Some((path, query)) = url.split_once('?') else {
        return (url, None);
    };
    let client_id = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CLIENT_ID_PARAM)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty());
    (path, client_id)
}

/// Extract the kernel id from a channel endpoint path.
pub fn kernel_id_from_path(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    let (prefix, last) = path.rsplit_once('/')?;
    if last != "channels" {
        return None;
    }
    let (service, kernel_id) = prefix.rsplit_once('/')?;
    if !service.ends_with(KERNEL_SERVICE_PATH) || kernel_id.is_empty() {
        return None;
    }
    Some(kernel_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoint_addresses() {
        assert_eq!(
            channels_url("local://hub", "k-1"),
            "local://hub/api/kernels/k-1/channels"
        );
        // trailing slash on the base does not double up
        assert_eq!(
            channels_url("local://hub/", "k-1"),
            "local://hub/api/kernels/k-1/channels"
        );
    }

    #[test]
    fn splits_client_id_from_query() {
        let url = "local://hub/api/kernels/k-1/channels?session_id=c-9";
        let (path, client_id) = split_client_id(url);
        assert_eq!(path, "local://hub/api/kernels/k-1/channels");
        assert_eq!(client_id, Some("c-9"));
    }

    #[test]
    fn missing_or_empty_client_id() {
        let (_, none) = split_client_id("local://hub/api/kernels/k-1/channels");
        assert_eq!(none, None);
        let (_, empty) = split_client_id("local://hub/api/kernels/k-1/channels?session_id=");
        assert_eq!(empty, None);
    }

    #[test]
    fn extracts_kernel_id() {
        assert_eq!(
            kernel_id_from_path("local://hub/api/kernels/k-1/channels"),
            Some("k-1")
        );
        assert_eq!(kernel_id_from_path("local://hub/api/kernels/k-1"), None);
        assert_eq!(kernel_id_from_path("local://hub/api/sessions/s/channels"), None);
    }
}
