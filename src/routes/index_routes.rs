//! Index page.
//!
//! The authentication check here is best-effort and time-bounded: the page
//! always renders, annotated with whether the visitor is signed in.

use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use tracing::error;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(index))
}

async fn index(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some((details, refreshed_storage)) = state.authenticator.check_identity(&jar).await else {
        return Html(
            "<!DOCTYPE html><html><body data-authenticated=\"false\">\
             <a href=\"/oauth2/authorize\">Sign in</a>\
             </body></html>"
                .to_string(),
        )
        .into_response();
    };

    let page = Html(format!(
        "<!DOCTYPE html><html><body data-authenticated=\"true\">\
         <p>Signed in as {}</p>\
         <form method=\"post\" action=\"/logout\"><button>Sign out</button></form>\
         </body></html>",
        html_escape(&details.profile_name)
    ));

    // The identity check may have rotated the refresh token; the rotated
    // storage must reach the cookies or the old token is burned.
    match refreshed_storage {
        Some(sealed) => match state
            .authenticator
            .cookies
            .set_storage(CookieJar::new(), &sealed)
        {
            Ok(jar) => (jar, page).into_response(),
            Err(e) => {
                error!("Failed to rewrite refreshed storage cookies: {}", e);
                page.into_response()
            }
        },
        None => page.into_response(),
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_in_profile_names() {
        assert_eq!(
            html_escape("<script>\"x\"&y"),
            "&lt;script&gt;&quot;x&quot;&amp;y"
        );
    }
}
