//! Report rendering. Both renderers are pure functions of the analysis and
//! the address, so the same inputs always produce byte-identical output.

use crate::schema::RoofAnalysis;

pub fn render_text(analysis: &RoofAnalysis, address: &str) -> String {
    let summary = analysis.summary.clone().unwrap_or_default();
    let measurements = analysis.measurements.clone().unwrap_or_default();
    let costs = analysis.cost_breakdown.clone().unwrap_or_default();
    let permits = analysis.permits.clone().unwrap_or_default();

    let risk = summary
        .overall_risk
        .filter(|r| !r.is_empty())
        .map(|r| r.to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let mut out = String::new();
    out.push_str("ROOF INSPECTION REPORT\n");
    out.push_str("======================\n\n");
    out.push_str(&format!("Property Address: {address}\n"));
    out.push_str("Generated by: Roof Dynamics AI Analysis\n\n");

    out.push_str("SUMMARY\n-------\n");
    out.push_str(&format!("Overall Risk Level: {risk}\n"));
    out.push_str(&format!(
        "Notes: {}\n\n",
        non_empty(summary.notes).unwrap_or_else(|| "No additional notes".to_string())
    ));

    out.push_str("MEASUREMENTS\n------------\n");
    out.push_str(&format!(
        "Total Roof Area: {} square feet\n",
        format_number(measurements.total_area_sqft)
    ));
    out.push_str(&format!(
        "Average Pitch: {}\n",
        non_empty(measurements.avg_pitch).unwrap_or_else(|| "Unknown".to_string())
    ));
    out.push_str(&format!(
        "Ridge Length: {} feet\n",
        format_number(measurements.ridge_length_ft)
    ));
    out.push_str(&format!(
        "Valley Length: {} feet\n",
        format_number(measurements.valley_length_ft)
    ));
    out.push_str(&format!(
        "Eaves Length: {} feet\n\n",
        format_number(measurements.eaves_length_ft)
    ));

    out.push_str("COST BREAKDOWN\n--------------\n");
    out.push_str(&format!("Labor Cost: ${}\n", format_thousands(costs.labor_usd)));
    out.push_str(&format!(
        "Materials Cost: ${}\n",
        format_thousands(costs.materials_usd)
    ));
    out.push_str(&format!(
        "Disposal Cost: ${}\n",
        format_thousands(costs.disposal_usd)
    ));
    out.push_str(&format!(
        "Contingency: ${}\n",
        format_thousands(costs.contingency_usd)
    ));
    out.push_str(&format!(
        "TOTAL ESTIMATED COST: ${}\n\n",
        format_thousands(costs.total_usd)
    ));

    out.push_str("IDENTIFIED RISKS\n----------------\n");
    out.push_str(&numbered(&analysis.risks, "No risks identified"));
    out.push_str("\n\n");

    out.push_str("MAINTENANCE RECOMMENDATIONS\n---------------------------\n");
    out.push_str(&numbered(
        &analysis.maintenance,
        "No maintenance recommendations",
    ));
    out.push_str("\n\n");

    out.push_str("PERMIT REQUIREMENTS\n-------------------\n");
    out.push_str(&format!(
        "Permits Required: {}\n",
        if permits.required.unwrap_or(false) {
            "YES"
        } else {
            "NO"
        }
    ));
    out.push_str(&format!(
        "Notes: {}\n\n",
        non_empty(permits.notes).unwrap_or_else(|| "No permit notes available".to_string())
    ));

    out.push_str("---\n");
    out.push_str(
        "This report was generated using AI analysis and should be reviewed by a qualified professional.\n",
    );
    out.push_str("For questions or concerns, please contact Roof Dynamics support.");
    out
}

pub fn render_html(analysis: &RoofAnalysis, address: &str) -> String {
    let summary = analysis.summary.clone().unwrap_or_default();
    let measurements = analysis.measurements.clone().unwrap_or_default();
    let costs = analysis.cost_breakdown.clone().unwrap_or_default();
    let permits = analysis.permits.clone().unwrap_or_default();
    let address = escape_html(address);

    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    out.push_str(&format!(
        "<title>Roof Inspection Report - {address}</title>\n"
    ));
    out.push_str(
        "<style>\n\
         body { font-family: Arial, sans-serif; margin: 20px; }\n\
         .header { text-align: center; margin-bottom: 30px; }\n\
         .section { margin-bottom: 25px; }\n\
         .table { width: 100%; border-collapse: collapse; }\n\
         .table th, .table td { border: 1px solid #ddd; padding: 8px; text-align: left; }\n\
         .table th { background-color: #f2f2f2; }\n\
         </style>\n</head>\n<body>\n",
    );

    out.push_str(&format!(
        "<div class=\"header\">\n<h1>Professional Roof Inspection Report</h1>\n<h2>{address}</h2>\n</div>\n"
    ));

    out.push_str("<div class=\"section\">\n<h3>Summary</h3>\n");
    out.push_str(&format!(
        "<p><strong>Overall Risk:</strong> {}</p>\n",
        escape_html(&non_empty(summary.overall_risk).unwrap_or_else(|| "N/A".to_string()))
    ));
    out.push_str(&format!(
        "<p><strong>Notes:</strong> {}</p>\n</div>\n",
        escape_html(&non_empty(summary.notes).unwrap_or_else(|| "N/A".to_string()))
    ));

    out.push_str("<div class=\"section\">\n<h3>Measurements</h3>\n<table class=\"table\">\n");
    out.push_str("<tr><th>Measurement</th><th>Value</th></tr>\n");
    let pitch = non_empty(measurements.avg_pitch).unwrap_or_else(|| "N/A".to_string());
    let rows = [
        (
            "Total Area",
            format!("{} sq ft", format_number(measurements.total_area_sqft)),
        ),
        ("Average Pitch", pitch),
        (
            "Ridge Length",
            format!("{} ft", format_number(measurements.ridge_length_ft)),
        ),
        (
            "Valley Length",
            format!("{} ft", format_number(measurements.valley_length_ft)),
        ),
        (
            "Eaves Length",
            format!("{} ft", format_number(measurements.eaves_length_ft)),
        ),
    ];
    for (label, value) in rows {
        out.push_str(&format!(
            "<tr><td>{label}</td><td>{}</td></tr>\n",
            escape_html(&value)
        ));
    }
    out.push_str("</table>\n</div>\n");

    out.push_str("<div class=\"section\">\n<h3>Cost Breakdown</h3>\n<table class=\"table\">\n");
    out.push_str("<tr><th>Item</th><th>Cost</th></tr>\n");
    for (label, value) in [
        ("Labor", costs.labor_usd),
        ("Materials", costs.materials_usd),
        ("Disposal", costs.disposal_usd),
        ("Contingency", costs.contingency_usd),
    ] {
        out.push_str(&format!(
            "<tr><td>{label}</td><td>${}</td></tr>\n",
            format_thousands(value)
        ));
    }
    out.push_str(&format!(
        "<tr><th>Total</th><th>${}</th></tr>\n</table>\n</div>\n",
        format_thousands(costs.total_usd)
    ));

    out.push_str("<div class=\"section\">\n<h3>Identified Risks</h3>\n<ul>\n");
    out.push_str(&list_items(&analysis.risks, "No risks identified"));
    out.push_str("</ul>\n</div>\n");

    out.push_str("<div class=\"section\">\n<h3>Maintenance Recommendations</h3>\n<ul>\n");
    out.push_str(&list_items(&analysis.maintenance, "No maintenance items"));
    out.push_str("</ul>\n</div>\n");

    out.push_str("<div class=\"section\">\n<h3>Permits</h3>\n");
    out.push_str(&format!(
        "<p><strong>Required:</strong> {}</p>\n",
        if permits.required.unwrap_or(false) {
            "Yes"
        } else {
            "No"
        }
    ));
    out.push_str(&format!(
        "<p><strong>Notes:</strong> {}</p>\n</div>\n",
        escape_html(&non_empty(permits.notes).unwrap_or_else(|| "N/A".to_string()))
    ));

    out.push_str("</body>\n</html>\n");
    out
}

/// `14850.0` -> `14,850`; `1234.5` -> `1,234.5`; missing -> `0`.
pub fn format_thousands(value: Option<f64>) -> String {
    let value = match value {
        Some(v) if v.is_finite() => v,
        _ => return "0".to_string(),
    };
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let fraction = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    match fraction {
        0 => format!("{sign}{grouped}"),
        f if f % 10 == 0 => format!("{sign}{grouped}.{}", f / 10),
        f => format!("{sign}{grouped}.{f:02}"),
    }
}

fn format_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v}"),
        _ => "0".to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn numbered(items: &Option<Vec<String>>, empty: &str) -> String {
    match items {
        Some(items) if !items.is_empty() => items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}. {item}", i + 1))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => empty.to_string(),
    }
}

fn list_items(items: &Option<Vec<String>>, empty: &str) -> String {
    match items {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|item| format!("<li>{}</li>\n", escape_html(item)))
            .collect(),
        _ => format!("<li>{empty}</li>\n"),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
