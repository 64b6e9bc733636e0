//! Declarations command

/// Prints the declarations of every global a script can use
pub fn print_types(testing: bool) {
    print!("{}", sandbox_js::declarations(testing));
}
