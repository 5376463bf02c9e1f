//! OpenAPI documentation

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{books, borrowing, health};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Shelfkeeper API",
        version = "1.0.0",
        description = "Library lending REST API",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Borrowing
        borrowing::borrow_book,
        borrowing::return_book,
        borrowing::my_history,
        borrowing::all_history,
        // Books
        books::most_borrowed,
        books::create_book,
        books::get_book,
        books::update_quantity,
        books::delete_book,
    ),
    components(
        schemas(
            // Books
            crate::models::book::Book,
            crate::models::book::NewBook,
            crate::models::book::UpdateQuantity,
            crate::models::book::MostBorrowedBook,
            // Borrowing
            crate::models::loan::LoanRecord,
            crate::models::loan::LoanState,
            crate::models::loan::LoanDetails,
            crate::models::loan::LoanBook,
            crate::models::loan::LoanBorrower,
            // Identifiers
            crate::models::ids::BookId,
            crate::models::ids::UserId,
            crate::models::ids::LoanId,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "borrowing", description = "Borrowing, returns and loan history"),
        (name = "books", description = "Book inventory and reports")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
