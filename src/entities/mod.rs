// Reference model - agencies, categories, programs
//
// Each entity module owns its row type, the builder that derives rows from
// upstream documents, and the replace-all load into the store.

pub mod agency;
pub mod category;
pub mod program;

pub use agency::{build_agencies, Agency, AgencyRegistry, AgencyReport};
pub use category::{
    build_categories, build_categories_from_csv, install_categories, link_programs,
    read_category_mapping, slug, Category, CategoryGraph, CategoryMappingRow, CategoryType,
    ProgramCategoryLink,
};
pub use program::{
    get_program, load_registry_programs, program_ids_of_type, Program, ProgramReport, ProgramType,
};
